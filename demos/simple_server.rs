//! Simple VNC server demo.
//!
//! Serves a single static test pattern (a gradient) to whatever connects.
//!
//! Usage:
//!   cargo run --example simple_server
//!
//! Then connect with a VNC viewer to localhost:5900, password "test123".

use async_trait::async_trait;
use bytes::Bytes;
use rfb_session::framebuffer::CapturedFramebuffer;
use rfb_session::protocol::PixelFormat;
use rfb_session::{CaptureSource, Listeners, Session, SessionOptions, StaticPasswordChallenge};
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpListener;

const WIDTH: u16 = 800;
const HEIGHT: u16 = 600;

struct GradientPattern {
    data: Bytes,
}

impl GradientPattern {
    fn new() -> Self {
        let format = PixelFormat::rgbx8888();
        let mut pixels = vec![0u8; usize::from(WIDTH) * usize::from(HEIGHT) * format.bytes_per_pixel()];
        for y in 0..usize::from(HEIGHT) {
            for x in 0..usize::from(WIDTH) {
                let offset = (y * usize::from(WIDTH) + x) * 4;
                pixels[offset] = (x * 255 / usize::from(WIDTH)) as u8;
                pixels[offset + 1] = (y * 255 / usize::from(HEIGHT)) as u8;
                pixels[offset + 2] = 128;
                pixels[offset + 3] = 255;
            }
        }
        Self { data: Bytes::from(pixels) }
    }
}

#[async_trait]
impl CaptureSource for GradientPattern {
    async fn capture(&self) -> Result<CapturedFramebuffer, String> {
        Ok(CapturedFramebuffer {
            width: WIDTH,
            height: HEIGHT,
            pixel_format: PixelFormat::rgbx8888(),
            stride: usize::from(WIDTH) * PixelFormat::rgbx8888().bytes_per_pixel(),
            data: self.data.clone(),
            hints: None,
        })
    }

    fn desktop_name(&self) -> String {
        "simple_server".to_string()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    println!("Starting VNC server on port 5900...");
    println!("Connect with: vncviewer localhost:5900");
    println!("Password: test123");

    let listener = TcpListener::bind("0.0.0.0:5900").await?;
    let capture = Arc::new(GradientPattern::new());
    let password = Arc::new(StaticPasswordChallenge::new("test123"));

    loop {
        let (stream, addr) = listener.accept().await?;
        println!("client connected: {addr}");
        let capture = capture.clone();
        let password = password.clone();
        tokio::spawn(async move {
            let session = Session::new(stream, capture, Some(password), Listeners::default(), SessionOptions::default());
            if let Err(e) = session.run().await {
                eprintln!("session ended for {addr}: {e}");
            }
        });
    }
}
