use clap::Parser;
use url::Url;

const DEFAULT_DISPATCH_URL: &str = "http://localhost:8080";
const DEFAULT_DB_PATH: &str = "transcoding_jobs.db";

/// Long flags this worker recognizes; anything else is dropped before
/// `clap` ever sees it, matching the original's tolerant argv scan.
const KNOWN_FLAGS: &[&str] = &[
    "--dispatch-url",
    "--ca-cert",
    "--api-key",
    "--hostname",
    "--db-path",
    "--help",
    "--version",
];

/// Filters raw process arguments down to recognized flags (and their
/// values) plus argv[0], so unrecognized flags never abort parsing.
pub fn filter_known_args<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    let mut out = Vec::new();
    let mut args = args.into_iter();
    if let Some(argv0) = args.next() {
        out.push(argv0);
    }

    while let Some(arg) = args.next() {
        let name = arg.split('=').next().unwrap_or(&arg);
        if !KNOWN_FLAGS.contains(&name) {
            continue;
        }
        out.push(arg.clone());
        // `--flag value` (space-separated) also carries its value, unless
        // the flag already embeds one via `--flag=value` or is a switch.
        if !arg.contains('=') && name != "--help" && name != "--version" {
            if let Some(value) = args.next() {
                out.push(value);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Parser)]
#[command(name = "tcworker", version, about = "Transcoding worker node")]
pub struct Cli {
    /// Dispatcher base URL.
    #[arg(long, env = "DISPATCH_URL", default_value = DEFAULT_DISPATCH_URL)]
    pub dispatch_url: Url,

    /// CA bundle used to verify the dispatcher's TLS certificate.
    #[arg(long, env = "CA_CERT")]
    pub ca_cert: Option<std::path::PathBuf>,

    /// Shared secret sent as `X-API-Key`; omitted if empty.
    #[arg(long, env = "API_KEY")]
    pub api_key: Option<String>,

    /// Overrides the reported hostname; defaults to the system hostname.
    #[arg(long, env = "HOSTNAME")]
    pub hostname: Option<String>,

    /// Path to the ledger's SQLite database file.
    #[arg(long, env = "DB_PATH", default_value = DEFAULT_DB_PATH)]
    pub db_path: std::path::PathBuf,
}
