//! HealthChecker variants: one probe attempt each, returning success or a typed
//! failure. All variants are bounded by a deadline passed in by the caller.

use std::net::TcpStream;
use std::process::Command;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::HealthCheckKind;

#[derive(Error, Debug, Clone)]
pub enum HealthCheckError {
    #[error("tcp connect to `{0}` failed: {1}")]
    ConnectFailed(String, String),

    #[error("http request to `{0}` failed: {1}")]
    RequestFailed(String, String),

    #[error("http response status {actual} did not match expected {expected}")]
    StatusMismatch { expected: u16, actual: u16 },

    #[error("exec command exited with status {0}")]
    CommandFailed(String),

    #[error("probe did not complete within {0:?}")]
    Timeout(Duration),
}

pub trait HealthChecker: Send + Sync {
    /// Runs one probe, bounded by `timeout`. Implementations must not block past
    /// `timeout`.
    fn check(&self, timeout: Duration) -> Result<(), HealthCheckError>;
}

pub struct TcpHealthChecker {
    pub address: String,
}

impl HealthChecker for TcpHealthChecker {
    fn check(&self, timeout: Duration) -> Result<(), HealthCheckError> {
        let addr = self
            .address
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                HealthCheckError::ConnectFailed(self.address.clone(), e.to_string())
            })?;
        TcpStream::connect_timeout(&addr, timeout)
            .map(|_| ())
            .map_err(|e| HealthCheckError::ConnectFailed(self.address.clone(), e.to_string()))
    }
}

pub trait HttpClient: Send + Sync {
    fn get(&self, url: &str, timeout: Duration) -> Result<u16, String>;
}

/// Default [`HttpClient`] using a blocking `reqwest::Client` built per-call with
/// the probe's own timeout, so one slow probe cannot poison subsequent ones.
pub struct ReqwestHttpClient;

impl HttpClient for ReqwestHttpClient {
    fn get(&self, url: &str, timeout: Duration) -> Result<u16, String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        client
            .get(url)
            .send()
            .map(|resp| resp.status().as_u16())
            .map_err(|e| e.to_string())
    }
}

pub struct HttpHealthChecker<C: HttpClient = ReqwestHttpClient> {
    pub url: String,
    pub expected_status: u16,
    pub client: C,
}

impl HttpHealthChecker<ReqwestHttpClient> {
    pub fn new(url: String, expected_status: u16) -> Self {
        Self {
            url,
            expected_status,
            client: ReqwestHttpClient,
        }
    }
}

impl<C: HttpClient> HealthChecker for HttpHealthChecker<C> {
    fn check(&self, timeout: Duration) -> Result<(), HealthCheckError> {
        let status = self
            .client
            .get(&self.url, timeout)
            .map_err(|e| HealthCheckError::RequestFailed(self.url.clone(), e))?;
        if status == self.expected_status {
            Ok(())
        } else {
            Err(HealthCheckError::StatusMismatch {
                expected: self.expected_status,
                actual: status,
            })
        }
    }
}

pub struct ExecHealthChecker {
    pub command: Vec<String>,
}

impl HealthChecker for ExecHealthChecker {
    fn check(&self, timeout: Duration) -> Result<(), HealthCheckError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(HealthCheckError::CommandFailed("empty command".to_string()));
        };
        let mut child = Command::new(program)
            .args(args)
            .spawn()
            .map_err(|e| HealthCheckError::CommandFailed(e.to_string()))?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return if status.success() {
                    Ok(())
                } else {
                    Err(HealthCheckError::CommandFailed(status.to_string()))
                };
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HealthCheckError::Timeout(timeout));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

/// Always succeeds: used for processes without a configured health check.
pub struct NoopHealthChecker;

impl HealthChecker for NoopHealthChecker {
    fn check(&self, _timeout: Duration) -> Result<(), HealthCheckError> {
        Ok(())
    }
}

pub fn checker_for(kind: &HealthCheckKind) -> Box<dyn HealthChecker> {
    match kind {
        HealthCheckKind::Tcp { address } => Box::new(TcpHealthChecker {
            address: address.clone(),
        }),
        HealthCheckKind::Http { url, expected_status } => {
            Box::new(HttpHealthChecker::new(url.clone(), *expected_status))
        }
        HealthCheckKind::Exec { command } => Box::new(ExecHealthChecker {
            command: command.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        pub Client {}
        impl HttpClient for Client {
            fn get(&self, url: &str, timeout: Duration) -> Result<u16, String>;
        }
    }

    #[test]
    fn tcp_checker_fails_on_unreachable_address() {
        let checker = TcpHealthChecker {
            address: "127.0.0.1:1".to_string(),
        };
        assert!(matches!(
            checker.check(Duration::from_millis(200)),
            Err(HealthCheckError::ConnectFailed(_, _))
        ));
    }

    #[test]
    fn http_checker_succeeds_on_expected_status() {
        let mut mock_client = MockClient::new();
        mock_client.expect_get().returning(|_, _| Ok(200));
        let checker = HttpHealthChecker {
            url: "http://example.invalid/ready".to_string(),
            expected_status: 200,
            client: mock_client,
        };
        assert!(checker.check(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn http_checker_reports_status_mismatch() {
        let mut mock_client = MockClient::new();
        mock_client.expect_get().returning(|_, _| Ok(503));
        let checker = HttpHealthChecker {
            url: "http://example.invalid/ready".to_string(),
            expected_status: 200,
            client: mock_client,
        };
        assert!(matches!(
            checker.check(Duration::from_secs(1)),
            Err(HealthCheckError::StatusMismatch {
                expected: 200,
                actual: 503
            })
        ));
    }

    #[test]
    fn exec_checker_succeeds_on_zero_exit() {
        let checker = ExecHealthChecker {
            command: vec!["true".to_string()],
        };
        assert!(checker.check(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn exec_checker_fails_on_non_zero_exit() {
        let checker = ExecHealthChecker {
            command: vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
        };
        assert!(matches!(
            checker.check(Duration::from_secs(1)),
            Err(HealthCheckError::CommandFailed(_))
        ));
    }

    #[test]
    fn noop_checker_always_succeeds() {
        assert!(NoopHealthChecker.check(Duration::from_millis(1)).is_ok());
    }
}
