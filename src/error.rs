use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ProvisionError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("missing required section `{section}` in {path}")]
    #[diagnostic(help("add a `{section}:` mapping under `virtual_machine`"))]
    MissingSection { section: &'static str, path: String },

    #[error("missing required field `{field}` in {path}")]
    MissingField { field: &'static str, path: String },

    #[error("missing required setting: set the {name} environment variable")]
    MissingSetting { name: &'static str },

    #[error("invalid setting {name}: {message}")]
    InvalidSetting { name: &'static str, message: String },

    #[error("{context}")]
    Http {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Proxmox API rejected {context}: {message}")]
    Api { context: String, message: String },

    #[error("task {upid} failed: {status}")]
    TaskFailed { upid: String, status: String },

    #[error("timed out after {seconds}s waiting for {context}")]
    Timeout { context: String, seconds: u64 },

    #[error(
        "cannot export {output}: VM '{vm}' reported {available} {kind}, but slot {index} was requested"
    )]
    ExportBounds {
        output: String,
        vm: String,
        kind: &'static str,
        index: usize,
        available: usize,
    },
}
