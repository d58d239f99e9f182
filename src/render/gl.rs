//! OpenGL render device.
//!
//! The platform owns the native context (display connection, config,
//! drawable) behind [`GlWindow`]; this module owns everything GL: the
//! shader pair, the texture pool and the per-quad draw path.

use std::collections::HashMap;
use std::ffi::{c_void, CString};

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use super::{RenderDevice, TextureId, QUAD_FLOATS};

/// Native GL drawable owned by the platform. Valid from window creation
/// until the platform announces window teardown.
pub trait GlWindow {
    fn make_current(&self) -> Result<()>;
    fn surface_size(&self) -> (i32, i32);
    fn swap_buffers(&self) -> Result<()>;
    fn load_fn(&self, name: &str) -> *const c_void;
}

const VERTEX_SHADER: &str = "\
attribute vec4 position;
attribute vec2 texCoords;
varying vec2 outTexCoords;

void main(void) {
    outTexCoords = texCoords;
    gl_Position = position;
}
";

const FRAGMENT_SHADER: &str = "\
precision mediump float;

varying vec2 outTexCoords;
uniform sampler2D tex;
uniform float alpha;

void main(void) {
    gl_FragColor = texture2D(tex, outTexCoords);
    gl_FragColor.a = alpha;
}
";

const STRIDE: i32 = 5 * std::mem::size_of::<f32>() as i32;

pub struct GlDevice {
    window: Box<dyn GlWindow>,
    program: u32,
    position_attrib: u32,
    texcoords_attrib: u32,
    alpha_uniform: i32,
    textures: HashMap<TextureId, u32>,
    next_texture: u32,
}

impl GlDevice {
    pub fn new(window: Box<dyn GlWindow>) -> Result<Self> {
        window.make_current()?;
        gl::load_with(|symbol| window.load_fn(symbol));

        unsafe {
            let version = gl::GetString(gl::VERSION);
            if !version.is_null() {
                info!(
                    "GL_VERSION = {}",
                    std::ffi::CStr::from_ptr(version as *const _).to_string_lossy()
                );
            }
        }

        let vs = compile_shader(gl::VERTEX_SHADER, VERTEX_SHADER)?;
        let fs = compile_shader(gl::FRAGMENT_SHADER, FRAGMENT_SHADER)?;
        let program = link_program(vs, fs)?;

        let (position_attrib, texcoords_attrib, alpha_uniform) = unsafe {
            gl::DeleteShader(vs);
            gl::DeleteShader(fs);

            let position = CString::new("position").unwrap();
            let texcoords = CString::new("texCoords").unwrap();
            let alpha = CString::new("alpha").unwrap();
            (
                gl::GetAttribLocation(program, position.as_ptr()) as u32,
                gl::GetAttribLocation(program, texcoords.as_ptr()) as u32,
                gl::GetUniformLocation(program, alpha.as_ptr()),
            )
        };

        let (width, height) = window.surface_size();
        unsafe {
            gl::Viewport(0, 0, width, height);
        }
        info!("GL renderer initialized ({width}x{height})");

        Ok(Self {
            window,
            program,
            position_attrib,
            texcoords_attrib,
            alpha_uniform,
            textures: HashMap::new(),
            next_texture: 1,
        })
    }

    fn gl_texture(&self, id: TextureId) -> Option<u32> {
        self.textures.get(&id).copied()
    }
}

impl RenderDevice for GlDevice {
    fn surface_size(&mut self) -> (i32, i32) {
        self.window.surface_size()
    }

    fn set_viewport(&mut self, width: i32, height: i32) {
        unsafe {
            gl::Viewport(0, 0, width, height);
        }
    }

    fn create_texture(&mut self) -> TextureId {
        let id = TextureId(self.next_texture);
        self.next_texture += 1;

        let mut texture = 0;
        unsafe {
            gl::GenTextures(1, &mut texture);
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
        self.textures.insert(id, texture);
        id
    }

    fn resize_texture(&mut self, id: TextureId, width: u32, height: u32) {
        let Some(texture) = self.gl_texture(id) else {
            return;
        };
        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl::RGBA as i32,
                width as i32,
                height as i32,
                0,
                gl::BGRA,
                gl::UNSIGNED_BYTE,
                std::ptr::null(),
            );
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
    }

    fn upload_rows(&mut self, id: TextureId, width: u32, y: u32, rows: u32, pixels: &[u8]) {
        let Some(texture) = self.gl_texture(id) else {
            return;
        };
        unsafe {
            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::TexSubImage2D(
                gl::TEXTURE_2D,
                0,
                0,
                y as i32,
                width as i32,
                rows as i32,
                gl::BGRA,
                gl::UNSIGNED_BYTE,
                pixels.as_ptr() as *const c_void,
            );
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
    }

    fn delete_texture(&mut self, id: TextureId) {
        if let Some(texture) = self.textures.remove(&id) {
            unsafe {
                gl::DeleteTextures(1, &texture);
            }
        }
    }

    fn clear(&mut self) {
        unsafe {
            gl::ClearColor(0.0, 0.0, 0.0, 0.0);
            gl::Clear(gl::DEPTH_BUFFER_BIT | gl::COLOR_BUFFER_BIT);
        }
    }

    fn draw_quad(&mut self, id: TextureId, vertices: &[f32; QUAD_FLOATS], alpha: f32) {
        let Some(texture) = self.gl_texture(id) else {
            return;
        };
        let blend = alpha < 1.0;
        unsafe {
            gl::UseProgram(self.program);

            gl::VertexAttribPointer(
                self.position_attrib,
                3,
                gl::FLOAT,
                gl::FALSE,
                STRIDE,
                vertices.as_ptr() as *const c_void,
            );
            gl::VertexAttribPointer(
                self.texcoords_attrib,
                2,
                gl::FLOAT,
                gl::FALSE,
                STRIDE,
                vertices[3..].as_ptr() as *const c_void,
            );
            gl::EnableVertexAttribArray(self.position_attrib);
            gl::EnableVertexAttribArray(self.texcoords_attrib);

            gl::Uniform1f(self.alpha_uniform, alpha);
            if blend {
                gl::Enable(gl::BLEND);
                gl::BlendFunc(gl::SRC_ALPHA, gl::ONE_MINUS_SRC_ALPHA);
            }

            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::DrawArrays(gl::TRIANGLE_STRIP, 0, 4);

            if blend {
                gl::Disable(gl::BLEND);
            }
            gl::DisableVertexAttribArray(self.position_attrib);
            gl::DisableVertexAttribArray(self.texcoords_attrib);
        }
    }

    fn present(&mut self) {
        unsafe {
            gl::Finish();
        }
        if let Err(e) = self.window.swap_buffers() {
            warn!("swap failed: {e:#}");
        }
    }
}

impl Drop for GlDevice {
    fn drop(&mut self) {
        unsafe {
            for texture in self.textures.values() {
                gl::DeleteTextures(1, texture);
            }
            gl::DeleteProgram(self.program);
        }
    }
}

fn compile_shader(kind: u32, source: &str) -> Result<u32> {
    unsafe {
        let shader = gl::CreateShader(kind);
        if shader == 0 {
            return Err(anyhow!("glCreateShader failed"));
        }
        let c_source = CString::new(source).expect("shader source contains NUL");
        gl::ShaderSource(shader, 1, &c_source.as_ptr(), std::ptr::null());
        gl::CompileShader(shader);

        let mut compiled = 0;
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut compiled);
        if compiled == 0 {
            let log = info_log(|len, written, buf| gl::GetShaderInfoLog(shader, len, written, buf));
            gl::DeleteShader(shader);
            return Err(anyhow!("shader compilation failed: {log}"));
        }
        Ok(shader)
    }
}

fn link_program(vs: u32, fs: u32) -> Result<u32> {
    unsafe {
        let program = gl::CreateProgram();
        if program == 0 {
            return Err(anyhow!("glCreateProgram failed"));
        }
        gl::AttachShader(program, vs);
        gl::AttachShader(program, fs);
        gl::LinkProgram(program);

        let mut linked = 0;
        gl::GetProgramiv(program, gl::LINK_STATUS, &mut linked);
        if linked == 0 {
            let log = info_log(|len, written, buf| gl::GetProgramInfoLog(program, len, written, buf));
            gl::DeleteProgram(program);
            return Err(anyhow!("program linking failed: {log}"));
        }
        Ok(program)
    }
}

fn info_log(fetch: impl Fn(i32, *mut i32, *mut std::os::raw::c_char)) -> String {
    let mut buf = vec![0u8; 1024];
    let mut written = 0;
    fetch(buf.len() as i32, &mut written, buf.as_mut_ptr() as *mut _);
    buf.truncate(written.max(0) as usize);
    String::from_utf8_lossy(&buf).into_owned()
}
