use core::{error::Error, net::SocketAddr, str::FromStr};
use std::path::PathBuf;

use bytes::Bytes;
use clap::{ArgAction, Parser};
use http::{header, Method, Request, Uri};
use http_body_util::Empty;

use crate::{
    cfg::ConfigError,
    scenario::http::{payload, Config as HttpConfig},
};

/// Constant arrival rate load generator.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
#[command(flatten_help = true)]
pub struct Cmd {
    #[clap(subcommand)]
    pub mode: ModeCmd,
    /// Path to the load profile file in YAML format.
    ///
    /// Overrides the rate and VU options given on the command line.
    #[clap(long, global = true)]
    pub profile: Option<PathBuf>,
    /// Threshold expression, may be repeated.
    ///
    /// For example "iteration_duration{scenario:main}:p(99.99)<50" or
    /// "iteration_failed:rate<0.0001".
    #[clap(long = "threshold", global = true)]
    pub thresholds: Vec<String>,
    /// Scenario tag every recorded iteration is attributed to.
    #[clap(long, default_value = "default", global = true)]
    pub tag: String,
    /// Write the final report as JSON to the given path.
    #[clap(long, global = true)]
    pub report_json: Option<PathBuf>,
    /// Be verbose in terms of logging.
    #[clap(short, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Parser)]
pub enum ModeCmd {
    /// HTTP mode.
    Http(HttpCmd),
}

#[derive(Debug, Clone, Parser)]
pub struct HttpCmd {
    /// Target endpoint.
    #[clap(required = true)]
    pub addr: SocketAddr,
    /// Workload settings.
    #[clap(flatten)]
    pub load: LoadCmd,
    /// Request URI (path and optional query).
    #[clap(long, default_value = "/")]
    pub uri: String,
    /// HTTP method.
    #[clap(long, default_value = "GET")]
    pub method: String,
    /// Value of the "Host" header. Defaults to the target endpoint.
    #[clap(long)]
    pub host: Option<String>,
    /// Additional header in "Name: value" form, may be repeated.
    #[clap(long = "header")]
    pub headers: Vec<String>,
    /// Path to the JSON-line ammo file.
    ///
    /// Overrides --uri, --method and --header.
    #[clap(long, value_name = "PATH")]
    pub payload_json: Option<PathBuf>,
    /// Expected response status. Anything else counts as a failed check.
    #[clap(long, default_value_t = 200)]
    pub expect_status: u16,
    /// Enable SOCK_NODELAY socket option.
    #[clap(long)]
    pub tcp_no_delay: bool,
}

/// Arrival rate and worker limits.
#[derive(Debug, Clone, Parser)]
pub struct LoadCmd {
    /// Target number of iterations started per time unit.
    #[clap(short, long, default_value_t = 1)]
    pub rate: u64,
    /// Time unit in seconds the rate is measured against.
    #[clap(long, default_value_t = 1)]
    pub time_unit: u64,
    /// Total run duration in seconds.
    #[clap(short, long, default_value_t = 60)]
    pub duration: u64,
    /// Number of workers created eagerly before the first tick.
    #[clap(long, default_value_t = 1)]
    pub pre_allocated_vus: usize,
    /// Upper bound on the number of workers.
    ///
    /// When the arrival rate outruns what the live workers can serve, the
    /// pool grows up to this ceiling; past it, ticks are dropped.
    #[clap(long, default_value_t = 100)]
    pub max_vus: usize,
    /// Per-iteration timeout in milliseconds.
    #[clap(long, default_value_t = 4000)]
    pub iteration_timeout: u64,
    /// Grace period in seconds for in-flight iterations at shutdown.
    #[clap(long, default_value_t = 30)]
    pub drain_grace: u64,
}

impl TryFrom<HttpCmd> for HttpConfig {
    type Error = Box<dyn Error>;

    fn try_from(cmd: HttpCmd) -> Result<Self, Self::Error> {
        let requests = match &cmd.payload_json {
            Some(path) => payload::from_fs(path)?,
            None => vec![build_request(&cmd)?],
        };
        if requests.is_empty() {
            return Err(ConfigError::NoRequests.into());
        }

        let m = Self {
            addr: cmd.addr,
            expect_status: cmd.expect_status,
            tcp_no_delay: cmd.tcp_no_delay,
            requests,
        };

        Ok(m)
    }
}

fn build_request(cmd: &HttpCmd) -> Result<Request<Empty<Bytes>>, Box<dyn Error>> {
    let uri = Uri::from_str(&cmd.uri)?;
    let host = cmd.host.clone().unwrap_or_else(|| cmd.addr.to_string());

    let mut request = Request::builder()
        .method(Method::from_bytes(cmd.method.as_bytes())?)
        .uri(uri)
        .header(header::HOST, host);
    for header in &cmd.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or("header must be in 'Name: value' form")?;
        request = request.header(name.trim(), value.trim());
    }

    Ok(request.body(Empty::new())?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg::Config;

    fn http_cmd(args: &[&str]) -> HttpCmd {
        let cmd = Cmd::try_parse_from([&["rush", "http", "127.0.0.1:8080"], args].concat()).unwrap();
        match cmd.mode {
            ModeCmd::Http(http) => http,
        }
    }

    #[test]
    fn test_build_request() {
        let cmd = http_cmd(&[
            "--uri",
            "/api/info",
            "--header",
            "Authorization: Bearer token",
        ]);
        let request = build_request(&cmd).unwrap();

        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().path(), "/api/info");
        assert_eq!(request.headers()[header::HOST], "127.0.0.1:8080");
        assert_eq!(request.headers()[header::AUTHORIZATION], "Bearer token");
    }

    #[test]
    fn test_rejects_malformed_header() {
        let cmd = http_cmd(&["--header", "not-a-header"]);

        assert!(build_request(&cmd).is_err());
    }

    #[test]
    fn test_cmd_into_config() {
        let cmd = Cmd::try_parse_from([
            "rush",
            "http",
            "127.0.0.1:8080",
            "--uri",
            "/api/info",
            "--rate",
            "1000",
            "--duration",
            "60",
            "--pre-allocated-vus",
            "200",
            "--max-vus",
            "1000",
            "--tag",
            "main_scenario",
            "--threshold",
            "iteration_duration{scenario:main_scenario}:p(99.99)<50",
            "--threshold",
            "iteration_failed{scenario:main_scenario}:rate<0.0001",
        ])
        .unwrap();

        let cfg: Config = cmd.try_into().unwrap();
        assert_eq!(cfg.load.rate, 1000);
        assert_eq!(cfg.load.max_vus, 1000);
        assert_eq!(cfg.tag, "main_scenario");
        assert_eq!(cfg.thresholds.len(), 2);
    }

    #[test]
    fn test_invalid_load_is_rejected() {
        let cmd = Cmd::try_parse_from(["rush", "http", "127.0.0.1:8080", "--rate", "0"]).unwrap();

        assert!(Config::try_from(cmd).is_err());
    }
}
