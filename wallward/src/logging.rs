use std::fs::OpenOptions;
use std::io;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const STDOUT_SINK: &str = "stdout";

/// Installs the global collector. `RUST_LOG` overrides the default level.
pub fn init(sink: &str, debug: bool) -> Result<(), io::Error> {
    let default_filter = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (writer, ansi) = if sink == STDOUT_SINK {
        (BoxMakeWriter::new(io::stdout), true)
    } else {
        let file = OpenOptions::new().create(true).append(true).open(sink)?;
        (BoxMakeWriter::new(file), false)
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(ansi))
        .with(filter)
        .init();
    Ok(())
}
