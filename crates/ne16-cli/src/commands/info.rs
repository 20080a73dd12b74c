//! `ne16 info`: Display version, configuration and environment.

use ne16_loader::LoaderConfig;
use serde::Serialize;

use crate::output::StyledOutput;

#[derive(Serialize)]
struct InfoReport<'a> {
    version: &'static str,
    config: &'a LoaderConfig,
    log_filter: Option<String>,
}

pub fn execute(out: &mut StyledOutput, config: &LoaderConfig, json: bool) -> anyhow::Result<()> {
    let report = InfoReport {
        version: env!("CARGO_PKG_VERSION"),
        config,
        log_filter: std::env::var("NE16_LOG").ok(),
    };
    if json {
        return out.json(&report);
    }

    out.heading(&format!("ne16 v{}", report.version));
    out.newline();
    out.heading("Configuration:");
    out.plain(&config.to_toml_string()?);
    out.newline();
    out.heading("Environment:");
    out.field("NE16_LOG", report.log_filter.as_deref().unwrap_or("(not set)"));
    Ok(())
}
