//! Tracing setup for the `rfs` binary.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Environment variable holding an explicit log filter.
const LOG_ENV: &str = "RFS_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    /// Compact lines interleaved with progress spinners.
    Interactive,
    /// Verbose span-annotated lines, for when a filter was asked for explicitly.
    Plain,
}

pub struct Trc {
    output: Output,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        match EnvFilter::try_from_env(LOG_ENV).or_else(|_| EnvFilter::try_from_default_env()) {
            Ok(env_filter) => Self {
                output: Output::Plain,
                env_filter,
            },
            Err(_) => Self {
                output: Output::Interactive,
                env_filter: EnvFilter::new("warn,remote_fs=info,rfs=info"),
            },
        }
    }
}

impl Trc {
    /// Forces plain output even without an explicit filter, e.g. when stderr is not a terminal.
    #[must_use]
    pub fn plain(mut self, plain: bool) -> Self {
        if plain {
            self.output = Output::Plain;
        }
        self
    }

    pub fn init(self) -> Result<(), TryInitError> {
        match self.output {
            Output::Plain => tracing_subscriber::fmt()
                .with_env_filter(self.env_filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(std::io::stderr)
                .finish()
                .try_init(),
            Output::Interactive => {
                let indicatif_layer = IndicatifLayer::new();
                tracing_subscriber::registry()
                    .with(self.env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(indicatif_layer.get_stderr_writer())
                            .with_target(false)
                            .without_time()
                            .compact(),
                    )
                    .with(indicatif_layer)
                    .try_init()
            }
        }
    }
}
