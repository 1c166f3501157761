use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to a JSON descriptor listing files, their checksums and mirrors.
    pub descriptor: PathBuf,

    /// Directory the files are written to. Entry names are resolved below it.
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    pub output: PathBuf,

    /// Verify files already on disk against the descriptor instead of downloading.
    #[arg(long, default_value_t = false)]
    pub check: bool,

    /// Max connections used in parallel for a single file.
    #[arg(long, value_name = "COUNT")]
    pub max_connections: Option<u64>,

    /// Two-letter location code of preferred mirrors, e.g. `de`. Derived from
    /// the locale when omitted.
    #[arg(long, value_name = "CC")]
    pub location: Option<String>,

    #[arg(long, value_name = "(http(s)|socks)://")]
    pub proxy: Option<String>,

    /// Max number of retries of a single HTTP request on a network error.
    #[arg(long, value_name = "COUNT")]
    pub retry: Option<u32>,

    /// Wait number of seconds after a network error before retry. Fractions are supported.
    #[arg(long, value_name = "Seconds")]
    pub waitretry: Option<f64>,

    /// Seconds without data before a connection is considered stalled.
    #[arg(long, value_name = "Seconds")]
    pub timeout: Option<f64>,

    /// Ignore and do not write resume records.
    #[arg(long, default_value_t = false)]
    pub no_resume: bool,

    /// Delete the bytes of a file that failed instead of keeping them for a later run.
    #[arg(long, default_value_t = false)]
    pub discard_partial: bool,

    /// Custom HTTP headers to include in each request. Specify as `KEY:VALUE`.
    #[arg(long = "header", value_name = "KEY:VALUE", num_args = 0.., action = clap::ArgAction::Append)]
    pub headers: Vec<String>,

    /// User agent to use for making requests.
    #[arg(short = 'U', long)]
    pub user_agent: Option<String>,

    /// Sets the downloaded file's last-modified timestamp to the server's value when available.
    #[arg(short, long, default_value_t = false)]
    pub use_server_time: bool,

    /// Should we accept invalid SSL certificates? Do not use unless you are absolutely sure of what you are doing.
    #[arg(long, default_value_t = false)]
    pub accept_invalid_certs: bool,

    /// Fail a file whose detached signature does not verify.
    #[arg(long, default_value_t = false)]
    pub require_signature: bool,
}
