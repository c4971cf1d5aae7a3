use std::path::Path;

use crate::{error::Result, wake::state::DownloadProgress};

/// Retrieves one remote model file.
///
/// Implementations run on a blocking task and report progress as bytes
/// arrive. `dest` is a temporary path; the caller renames it into place only
/// after `fetch` returns `Ok`.
pub trait ModelFetcher: Send + Sync + 'static {
    /// # Errors
    /// Returns `HarkError::Download` for network or HTTP failures.
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<()>;
}

#[cfg(feature = "download")]
pub use http::HttpFetcher;

#[cfg(feature = "download")]
mod http {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::path::Path;
    use std::time::Duration;

    use tracing::{debug, info};

    use super::ModelFetcher;
    use crate::{
        error::{HarkError, Result},
        wake::state::DownloadProgress,
    };

    const READ_BUF: usize = 64 * 1024;

    /// Blocking HTTP(S) fetcher over `reqwest`.
    #[derive(Debug, Clone)]
    pub struct HttpFetcher {
        client: reqwest::blocking::Client,
    }

    impl HttpFetcher {
        /// # Errors
        /// Returns `HarkError::Download` if the TLS client cannot be built.
        pub fn new() -> Result<Self> {
            let client = reqwest::blocking::Client::builder()
                .connect_timeout(Duration::from_secs(15))
                .timeout(Duration::from_secs(300))
                .build()
                .map_err(|e| HarkError::Download(format!("client build failed: {e}")))?;
            Ok(Self { client })
        }
    }

    impl ModelFetcher for HttpFetcher {
        fn fetch(
            &self,
            url: &str,
            dest: &Path,
            progress: &mut dyn FnMut(DownloadProgress),
        ) -> Result<()> {
            let mut response = self
                .client
                .get(url)
                .send()
                .map_err(|e| HarkError::Download(format!("{url}: {e}")))?;
            if !response.status().is_success() {
                return Err(HarkError::Download(format!(
                    "{url}: HTTP {}",
                    response.status()
                )));
            }

            let total_bytes = response.content_length();
            debug!(url, ?total_bytes, "download started");

            let mut file = File::create(dest)?;
            let mut buf = vec![0u8; READ_BUF];
            let mut downloaded_bytes = 0u64;
            progress(DownloadProgress {
                downloaded_bytes,
                total_bytes,
            });
            loop {
                let n = response
                    .read(&mut buf)
                    .map_err(|e| HarkError::Download(format!("{url}: {e}")))?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n])?;
                downloaded_bytes += n as u64;
                progress(DownloadProgress {
                    downloaded_bytes,
                    total_bytes,
                });
            }
            file.flush()?;

            info!(url, downloaded_bytes, "download complete");
            Ok(())
        }
    }
}
