//! Initialises the global tracing subscriber.

use clap::ValueEnum;
use snafu::{ResultExt, Snafu};
use strum::Display;
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, layer::SubscriberExt};

/// The environment variable overriding the default log directive.
pub const LOG_ENV_VAR: &str = "RUST_LOG";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber { source: SetGlobalDefaultError },
}

/// How console log lines are rendered.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Create an [`EnvFilter`] reading [`LOG_ENV_VAR`], falling back to `default_directive`.
fn env_filter(default_directive: impl Into<Directive>) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(default_directive.into())
        .from_env_lossy()
}

/// Installs a console subscriber logging at `level` and above in the given `format`.
pub fn init(level: LevelFilter, format: LogFormat) -> Result<(), Error> {
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Plain => tracing_subscriber::fmt::layer()
            .with_filter(env_filter(level))
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(env_filter(level))
            .boxed(),
    };

    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layer))
        .context(SetGlobalDefaultSubscriberSnafu)
}
