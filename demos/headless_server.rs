//! Headless VNC server demo with animated content.
//!
//! Generates an animated gradient in a background task instead of capturing
//! a real screen, demonstrating how to drive [`rfb_session::Session`] from a
//! synthetic [`CaptureSource`].
//!
//! Usage:
//!   cargo run --example headless_server

use async_trait::async_trait;
use bytes::Bytes;
use rfb_session::framebuffer::CapturedFramebuffer;
use rfb_session::protocol::PixelFormat;
use rfb_session::{CaptureSource, Listeners, Session, SessionOptions};
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time;

const WIDTH: u16 = 640;
const HEIGHT: u16 = 480;

struct AnimatedSource {
    pixels: Mutex<Bytes>,
}

impl AnimatedSource {
    fn new() -> Self {
        let stride = usize::from(WIDTH) * PixelFormat::rgbx8888().bytes_per_pixel();
        Self { pixels: Mutex::new(Bytes::from(vec![0u8; stride * usize::from(HEIGHT)])) }
    }

    fn render_frame(&self, frame: u32) {
        let mut pixels = vec![0u8; usize::from(WIDTH) * usize::from(HEIGHT) * 4];
        for y in 0..usize::from(HEIGHT) {
            for x in 0..usize::from(WIDTH) {
                let offset = (y * usize::from(WIDTH) + x) * 4;
                pixels[offset] = ((x as u32 + frame) % 256) as u8;
                pixels[offset + 1] = ((y as u32 + frame) % 256) as u8;
                pixels[offset + 2] = ((frame / 2) % 256) as u8;
                pixels[offset + 3] = 255;
            }
        }
        *self.pixels.lock().expect("pixel buffer mutex poisoned") = Bytes::from(pixels);
    }
}

#[async_trait]
impl CaptureSource for AnimatedSource {
    async fn capture(&self) -> Result<CapturedFramebuffer, String> {
        let data = self.pixels.lock().expect("pixel buffer mutex poisoned").clone();
        Ok(CapturedFramebuffer {
            width: WIDTH,
            height: HEIGHT,
            pixel_format: PixelFormat::rgbx8888(),
            stride: usize::from(WIDTH) * PixelFormat::rgbx8888().bytes_per_pixel(),
            data,
            hints: None,
        })
    }

    fn desktop_name(&self) -> String {
        "headless_server".to_string()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    println!("Starting headless VNC server on port 5900...");
    println!("Connect with: vncviewer localhost:5900");

    let source = Arc::new(AnimatedSource::new());

    let animator = source.clone();
    tokio::spawn(async move {
        let mut frame = 0u32;
        loop {
            animator.render_frame(frame);
            frame = frame.wrapping_add(1);
            time::sleep(Duration::from_millis(33)).await;
            if frame % 300 == 0 {
                println!("frame: {frame}");
            }
        }
    });

    let listener = TcpListener::bind("0.0.0.0:5900").await?;
    loop {
        let (stream, addr) = listener.accept().await?;
        println!("client connected: {addr}");
        let source = source.clone();
        tokio::spawn(async move {
            let session = Session::new(stream, source, None, Listeners::default(), SessionOptions::default());
            if let Err(e) = session.run().await {
                eprintln!("session ended for {addr}: {e}");
            }
        });
    }
}
