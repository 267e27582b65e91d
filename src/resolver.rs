use std::fmt;
use std::io;
use std::net::IpAddr;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use log::*;
use reqwest::Client;
use tokio::process::Command;
use tokio::time::{self, Instant};

/// Public IP echo services, in priority order.
pub const LOOKUP_SERVICES: [&str; 3] = [
    "https://ifconfig.me/ip",
    "https://api.ipify.org",
    "https://icanhazip.com",
];
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const FETCH_COMMAND: &str = "curl";

const MAX_SNIPPET_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Bad status code: {0}")]
    Status(u16),
    #[error("Timed out")]
    Timeout,
    #[error("Empty response body")]
    Empty,
    #[error("Not an IP address: {0:?}")]
    Malformed(String),
    #[error("Command exited with status {0:?}")]
    Command(Option<i32>),
    #[error("Fetch method unavailable: {0}")]
    Unavailable(#[source] io::Error),
    #[error("IO Error: {0}")]
    IO(#[from] io::Error),
}

#[derive(Debug)]
pub struct Attempt {
    pub method: &'static str,
    pub service: String,
    pub error: LookupError,
}

/// Every attempt of a resolution pass failed.
#[derive(Debug)]
pub struct ResolutionFailure {
    pub attempts: Vec<Attempt>,
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to retrieve external IP address from all services")?;
        for attempt in &self.attempts {
            write!(
                f,
                "\n- {} via {}: {}",
                attempt.service, attempt.method, attempt.error
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for ResolutionFailure {}

/// One way of retrieving the body of a lookup service.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn method(&self) -> &'static str;

    async fn fetch(&self, url: &str) -> Result<String, LookupError>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().gzip(true).timeout(timeout).build()?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn method(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, url: &str) -> Result<String, LookupError> {
        let response = self.client.get(url).send().await.map_err(http_error)?;
        if !response.status().is_success() {
            return Err(LookupError::Status(response.status().as_u16()));
        }
        response.text().await.map_err(http_error)
    }
}

fn http_error(e: reqwest::Error) -> LookupError {
    if e.is_timeout() {
        LookupError::Timeout
    } else {
        LookupError::Http(e)
    }
}

/// Shells out to a curl-compatible tool.
pub struct CommandFetcher {
    program: String,
    timeout: Duration,
}

impl CommandFetcher {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        CommandFetcher {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    fn method(&self) -> &'static str {
        "command"
    }

    async fn fetch(&self, url: &str) -> Result<String, LookupError> {
        let max_time = self.timeout.as_secs().max(1).to_string();
        let child = Command::new(&self.program)
            .args(["-sf", "--max-time", max_time.as_str(), url])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => LookupError::Unavailable(e),
                _ => LookupError::IO(e),
            })?;

        let output = time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| LookupError::Timeout)??;
        if !output.status.success() {
            return Err(LookupError::Command(output.status.code()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Trims the body and parses it as an IPv4 or IPv6 address.
pub fn parse_address(body: &str) -> Result<IpAddr, LookupError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(LookupError::Empty);
    }
    IpAddr::from_str(body)
        .map_err(|_| LookupError::Malformed(body.chars().take(MAX_SNIPPET_LEN).collect()))
}

pub struct ExternalIpResolver {
    services: Vec<String>,
    fetchers: Vec<Box<dyn Fetcher>>,
}

impl ExternalIpResolver {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::builder().build()
    }

    pub fn builder() -> ResolverBuilder {
        ResolverBuilder::default()
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Walks every fetch method over every service and returns the first valid address.
    pub async fn resolve(&self) -> Result<IpAddr, ResolutionFailure> {
        let mut attempts = Vec::new();
        for fetcher in &self.fetchers {
            let method = fetcher.method();
            for service in &self.services {
                debug!("Trying to fetch IP from {service} via {method}");
                let start = Instant::now();
                match fetcher
                    .fetch(service)
                    .await
                    .and_then(|body| parse_address(&body))
                {
                    Ok(ip) => {
                        info!(
                            "Fetched IP {ip} from {service} via {method} in {}ms",
                            start.elapsed().as_millis()
                        );
                        return Ok(ip);
                    }
                    Err(error) => {
                        debug!("Failed to fetch IP from {service} via {method}: {error}");
                        let unavailable = matches!(error, LookupError::Unavailable(_));
                        attempts.push(Attempt {
                            method,
                            service: service.clone(),
                            error,
                        });
                        if unavailable {
                            warn!("Skipping {method} lookups, method unavailable");
                            break;
                        }
                    }
                }
            }
        }

        error!("All methods to fetch external IP failed");
        Err(ResolutionFailure { attempts })
    }
}

pub struct ResolverBuilder {
    services: Vec<String>,
    timeout: Duration,
    command: Option<String>,
}

impl Default for ResolverBuilder {
    fn default() -> Self {
        ResolverBuilder {
            services: LOOKUP_SERVICES.iter().map(|s| s.to_string()).collect(),
            timeout: LOOKUP_TIMEOUT,
            command: Some(FETCH_COMMAND.to_string()),
        }
    }
}

impl ResolverBuilder {
    pub fn services(mut self, services: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(mut self, program: impl Into<String>) -> Self {
        self.command = Some(program.into());
        self
    }

    pub fn without_command(mut self) -> Self {
        self.command = None;
        self
    }

    pub fn build(self) -> Result<ExternalIpResolver, reqwest::Error> {
        let mut fetchers: Vec<Box<dyn Fetcher>> = vec![Box::new(HttpFetcher::new(self.timeout)?)];
        if let Some(program) = self.command {
            fetchers.push(Box::new(CommandFetcher::new(program, self.timeout)));
        }
        Ok(ExternalIpResolver {
            services: self.services,
            fetchers,
        })
    }
}

#[cfg(test)]
mod test {
    use std::error::Error;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::time::Duration;

    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const MISSING_TOOL: &str = "ip-server-missing-fetch-tool";

    async fn service(status: u16, body: &str, expected_calls: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .expect(expected_calls)
            .mount(&server)
            .await;
        server
    }

    fn resolver(servers: &[&MockServer]) -> ExternalIpResolver {
        ExternalIpResolver::builder()
            .services(servers.iter().map(|s| s.uri()))
            .timeout(Duration::from_secs(2))
            .command(MISSING_TOOL)
            .build()
            .unwrap()
    }

    #[test]
    fn default_service_order() {
        let resolver = ExternalIpResolver::new().unwrap();
        assert_eq!(
            resolver.services(),
            ["https://ifconfig.me/ip", "https://api.ipify.org", "https://icanhazip.com"]
        );
    }

    #[test]
    fn parses_addresses() {
        assert_eq!(
            parse_address(" 203.0.113.42\n").unwrap(),
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 42))
        );
        assert_eq!(
            parse_address("2001:db8::1\n").unwrap(),
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1))
        );
        assert!(matches!(parse_address(" \n"), Err(LookupError::Empty)));
        assert!(matches!(parse_address("256.1.1.1"), Err(LookupError::Malformed(_))));
        assert!(matches!(parse_address("10.0.0"), Err(LookupError::Malformed(_))));
        assert!(matches!(
            parse_address("<html><body>502 Bad Gateway</body></html>"),
            Err(LookupError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn first_service_short_circuits() -> Result<(), Box<dyn Error>> {
        let first = service(200, "203.0.113.42\n", 1).await;
        let second = service(200, "198.51.100.7", 0).await;
        let third = service(200, "198.51.100.8", 0).await;

        let ip = resolver(&[&first, &second, &third]).resolve().await?;
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 42)));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_body_falls_through() -> Result<(), Box<dyn Error>> {
        let first = service(200, "<html>rate limited</html>", 1).await;
        let second = service(503, "unavailable", 1).await;
        let third = service(200, "198.51.100.8", 1).await;

        let ip = resolver(&[&first, &second, &third]).resolve().await?;
        assert_eq!(ip.to_string(), "198.51.100.8");
        Ok(())
    }

    #[tokio::test]
    async fn all_services_failing() {
        let first = service(500, "", 1).await;
        let second = service(200, "", 1).await;
        let third = service(200, "not an ip", 1).await;

        let failure = resolver(&[&first, &second, &third])
            .resolve()
            .await
            .unwrap_err();
        let errors: Vec<_> = failure.attempts.iter().map(|a| &a.error).collect();
        assert_eq!(failure.attempts.len(), 4);
        assert!(matches!(errors[0], LookupError::Status(500)));
        assert!(matches!(errors[1], LookupError::Empty));
        assert!(matches!(errors[2], LookupError::Malformed(_)));
        assert!(matches!(errors[3], LookupError::Unavailable(_)));
        assert_eq!(failure.attempts[3].method, "command");
        assert!(failure.to_string().contains(&first.uri()));
    }

    #[tokio::test]
    async fn unreachable_services_without_command() {
        let resolver = ExternalIpResolver::builder()
            .services(["http://127.0.0.1:1", "http://127.0.0.1:2"])
            .timeout(Duration::from_secs(1))
            .without_command()
            .build()
            .unwrap();

        let failure = resolver.resolve().await.unwrap_err();
        assert_eq!(failure.attempts.len(), 2);
        assert!(failure
            .attempts
            .iter()
            .all(|a| a.method == "http" && matches!(a.error, LookupError::Http(_))));
    }

    #[tokio::test]
    async fn repeated_calls_are_not_cached() -> Result<(), Box<dyn Error>> {
        let first = service(200, "203.0.113.42", 2).await;
        let resolver = resolver(&[&first]);

        let a = resolver.resolve().await?;
        let b = resolver.resolve().await?;
        assert_eq!(a, b);
        Ok(())
    }

    #[tokio::test]
    async fn missing_command_is_unavailable() {
        let fetcher = CommandFetcher::new(MISSING_TOOL, Duration::from_secs(1));
        let result = fetcher.fetch("http://127.0.0.1:1").await;
        assert!(matches!(result, Err(LookupError::Unavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_exit_status() {
        let fetcher = CommandFetcher::new("false", Duration::from_secs(1));
        let result = fetcher.fetch("http://127.0.0.1:1").await;
        assert!(matches!(result, Err(LookupError::Command(Some(1)))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_fallback_after_http_fails() -> Result<(), Box<dyn Error>> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let program = dir.path().join("fetch-ip");
        let calls = dir.path().join("calls.log");
        std::fs::write(
            &program,
            format!(
                "#!/bin/sh\necho \"$@\" >> {}\necho 198.51.100.9\n",
                calls.display()
            ),
        )?;
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755))?;

        let resolver = ExternalIpResolver::builder()
            .services(["http://127.0.0.1:1", "http://127.0.0.1:2"])
            .timeout(Duration::from_secs(1))
            .command(program.to_string_lossy())
            .build()?;

        let ip = resolver.resolve().await?;
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)));

        let calls = std::fs::read_to_string(&calls)?;
        assert_eq!(calls.lines().collect::<Vec<_>>(), ["-sf --max-time 1 http://127.0.0.1:1"]);
        Ok(())
    }

    #[tokio::test]
    async fn slow_service_times_out() -> Result<(), Box<dyn Error>> {
        let slow = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("203.0.113.42")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&slow)
            .await;
        let resolver = ExternalIpResolver::builder()
            .services([slow.uri()])
            .timeout(Duration::from_secs(1))
            .without_command()
            .build()?;

        let start = Instant::now();
        let failure = resolver.resolve().await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
        assert_eq!(failure.attempts.len(), 1);
        assert!(matches!(failure.attempts[0].error, LookupError::Timeout));
        assert!(failure.to_string().contains("Timed out"));
        Ok(())
    }
}
