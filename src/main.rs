//! glint compositor entry point.

use std::rc::Rc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use glint::compositor::{Compositor, CompositorOptions};
use glint::config::Config;
use glint::event_loop::EventLoop;
use glint::platform::headless::HeadlessPlatform;
use glint::platform::Platform;
use glint::server::IpcServer;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "glint=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting glint compositor");

    let config = Config::load().context("failed to load configuration")?;

    let mut event_loop = EventLoop::new().context("failed to create event loop")?;
    let handle = event_loop.handle();

    let platform = HeadlessPlatform::new(
        &handle,
        config.display.width,
        config.display.height,
        config.display.frame_rate,
    )
    .context("failed to initialize platform")?;

    let server = IpcServer::bind(&config.socket_path(), handle.clone())
        .context("failed to start IPC server")?;

    let compositor = Compositor::new(
        platform.clone() as Rc<dyn Platform>,
        server,
        event_loop.sender(),
        CompositorOptions {
            echo_broadcast: config.debug.echo_broadcast,
            force_full_upload: config.debug.force_full_upload,
        },
    );
    Compositor::wire(&compositor, &handle);

    platform.announce_window();

    event_loop.run()
}
