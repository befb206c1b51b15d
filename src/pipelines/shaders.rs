// GLSL sources for the two fixed pipelines
//
// These are compiled to SPIR-V with shaderc while the pipelines are
// being built, never per frame. Both vertex shaders synthesize one
// screen-space quad per draw from a rectangle in the push constants:
// gl_VertexIndex selects a corner, which gets mapped from pixel
// coordinates into NDC by the viewport size. There are no vertex
// buffers anywhere in this backend.
//
// The push constant offsets are load-bearing: the recording code
// updates the viewport/origin/color blocks once per call and only
// rewrites the rectangle between draws.

pub const COMPOSE_VERTEX_SHADER: &str = "
#version 450

layout(push_constant) uniform Push {
    layout(offset = 0) uvec2 viewport;
    layout(offset = 8) ivec2 rect_min;
    layout(offset = 16) ivec2 rect_max;
    layout(offset = 24) ivec2 image_origin;
} push;

layout(location = 0) out vec2 out_coord;

void main() {
    ivec2 corner = ivec2(
        (gl_VertexIndex & 1) == 0 ? push.rect_min.x : push.rect_max.x,
        (gl_VertexIndex & 2) == 0 ? push.rect_min.y : push.rect_max.y);

    // texture coordinates are in source image pixels, normalized in
    // the fragment shader
    out_coord = vec2(corner - push.image_origin);
    gl_Position = vec4(2.0 * vec2(corner) / vec2(push.viewport) - 1.0, 0.0, 1.0);
}
";

pub const COMPOSE_FRAGMENT_SHADER: &str = "
#version 450

layout(set = 0, binding = 0) uniform sampler2D window;

layout(location = 0) in vec2 in_coord;
layout(location = 0) out vec4 out_color;

void main() {
    out_color = texture(window, in_coord / vec2(textureSize(window, 0)));
}
";

pub const FILL_VERTEX_SHADER: &str = "
#version 450

layout(push_constant) uniform Push {
    layout(offset = 0) uvec2 viewport;
    layout(offset = 8) ivec2 rect_min;
    layout(offset = 16) ivec2 rect_max;
} push;

void main() {
    ivec2 corner = ivec2(
        (gl_VertexIndex & 1) == 0 ? push.rect_min.x : push.rect_max.x,
        (gl_VertexIndex & 2) == 0 ? push.rect_min.y : push.rect_max.y);

    gl_Position = vec4(2.0 * vec2(corner) / vec2(push.viewport) - 1.0, 0.0, 1.0);
}
";

pub const FILL_FRAGMENT_SHADER: &str = "
#version 450

layout(push_constant) uniform Push {
    layout(offset = 32) vec4 color;
} push;

layout(location = 0) out vec4 out_color;

void main() {
    out_color = push.color;
}
";
