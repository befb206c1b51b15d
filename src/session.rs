// The windowing system session this backend renders for
//
// The compositor proper owns the event loop and all window policy. What
// we get from it is one X connection for pixmap traffic, the root visual
// to test presentation support against, and which transport extensions
// the server advertised. Everything protocol-related in this crate goes
// through this struct.

use crate::{Result, SquallError};

use std::sync::Arc;

use x11rb::connection::Connection;
use x11rb::connection::RequestConnection;
use x11rb::protocol::{dri3, shm};
use x11rb::xcb_ffi::XCBConnection;

use log;

/// An active connection to the X server.
///
/// The backend needs to know up front whether the DRI3 and MIT-SHM
/// extensions exist, since that decides which pixmap import strategy the
/// device will be created for. Both flags are probed once at connect
/// time.
pub struct Session {
    /// The shared connection used for pixmap requests. The surface gets
    /// its own private connection, see `Display`.
    s_conn: Arc<XCBConnection>,
    /// Index of the screen we composite.
    s_screen: usize,
    /// The root visual of that screen.
    s_root_visual: u32,
    /// Does the server speak DRI3 (dma-buf export)?
    s_dri3_present: bool,
    /// Does the server speak MIT-SHM?
    s_shm_present: bool,
    /// Throttle presentation to the display's refresh.
    s_vsync: bool,
}

impl Session {
    /// Open a new connection to the default display.
    pub fn connect(vsync: bool) -> Result<Self> {
        let (conn, screen) =
            XCBConnection::connect(None).map_err(|_| SquallError::CONNECT_FAILED)?;

        Self::from_connection(Arc::new(conn), screen, vsync)
    }

    /// Wrap a connection the compositor already owns.
    pub fn from_connection(
        conn: Arc<XCBConnection>,
        screen: usize,
        vsync: bool,
    ) -> Result<Self> {
        let root_visual = conn
            .setup()
            .roots
            .get(screen)
            .ok_or(SquallError::CONNECT_FAILED)?
            .root_visual;

        let dri3_present = conn
            .extension_information(dri3::X11_EXTENSION_NAME)
            .map_err(|_| SquallError::CONNECT_FAILED)?
            .is_some();
        let shm_present = conn
            .extension_information(shm::X11_EXTENSION_NAME)
            .map_err(|_| SquallError::CONNECT_FAILED)?
            .is_some();

        log::debug!(
            "X session: dri3={}, shm={}, vsync={}",
            dri3_present,
            shm_present,
            vsync
        );

        Ok(Self {
            s_conn: conn,
            s_screen: screen,
            s_root_visual: root_visual,
            s_dri3_present: dri3_present,
            s_shm_present: shm_present,
            s_vsync: vsync,
        })
    }

    pub fn conn(&self) -> &XCBConnection {
        &self.s_conn
    }

    pub fn clone_conn(&self) -> Arc<XCBConnection> {
        self.s_conn.clone()
    }

    pub fn screen(&self) -> usize {
        self.s_screen
    }

    pub fn root_visual(&self) -> u32 {
        self.s_root_visual
    }

    pub fn has_dri3(&self) -> bool {
        self.s_dri3_present
    }

    pub fn has_shm(&self) -> bool {
        self.s_shm_present
    }

    pub fn vsync(&self) -> bool {
        self.s_vsync
    }
}
