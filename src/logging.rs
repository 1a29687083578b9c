//! Tracing subscriber setup for embedders and tests.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, SessionError};

/// Installs a stderr formatting subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` is parsed as an
/// `EnvFilter` directive such as `"info"` or `"sombra_session=debug"`.
/// Calling this again, or after the embedder installed its own global
/// subscriber, leaves the existing one in place.
pub fn init_logging(default_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level).map_err(|e| {
            SessionError::invalid(format!("invalid log directive `{default_level}`: {e}"))
        })?,
    };
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_directives() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(matches!(
            init_logging("sombra_session=notalevel"),
            Err(SessionError::Invalid(_))
        ));
    }

    #[test]
    fn repeated_initialisation_is_harmless() -> Result<()> {
        init_logging("warn")?;
        init_logging("debug")?;
        Ok(())
    }
}
