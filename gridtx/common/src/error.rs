use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("transaction id overflow, reached {0}")]
    TxnIdOverflow(u64),

    #[error("entry version overflow, reached {0}")]
    VersionOverflow(u64),
}
