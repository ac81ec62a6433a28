//! Remote dispatcher driving the system `sftp` client in batch mode.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::config::{RemoteStorageConfig, StorageMode};
use super::error::DispatchError;
use super::traits::StorageDispatcher;
use super::types::{DispatchRequest, DispatchResult};
use crate::metrics;

/// Uploads artifacts to `<remote_dir>/<quadrant>/<year>/<season>/` over SFTP.
///
/// Authentication is key based; the session runs with `BatchMode=yes` so it
/// never blocks on a password prompt.
pub struct SftpDispatcher {
    config: RemoteStorageConfig,
}

impl SftpDispatcher {
    pub fn new(config: RemoteStorageConfig) -> Self {
        Self { config }
    }

    fn target(&self) -> String {
        format!("{}@{}", self.config.username, self.config.host)
    }

    /// Command line for one batch session. The script is fed on stdin.
    pub(crate) fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-b".to_string(),
            "-".to_string(),
            "-P".to_string(),
            self.config.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(identity) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        for option in &self.config.ssh_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(self.target());
        args
    }

    /// Remote directory for a request.
    pub(crate) fn remote_dir(&self, request: &DispatchRequest) -> String {
        let mut dir = self.config.remote_dir.trim_end_matches('/').to_string();
        for component in request.relative_components() {
            dir.push('/');
            dir.push_str(&component);
        }
        dir
    }

    /// Batch script: create each directory level (ignoring "already exists"),
    /// upload sidecars, then the artifact.
    pub(crate) fn build_script(&self, request: &DispatchRequest) -> Result<String, DispatchError> {
        let mut script = String::new();
        let mut dir = self.config.remote_dir.trim_end_matches('/').to_string();
        if !dir.is_empty() {
            script.push_str(&format!("-mkdir {}\n", quote(&dir)));
        }
        for component in request.relative_components() {
            dir.push('/');
            dir.push_str(&component);
            script.push_str(&format!("-mkdir {}\n", quote(&dir)));
        }

        let uploads = request.sidecars.iter().map(|p| p.as_path());
        for local in uploads.chain(std::iter::once(request.artifact.path.as_path())) {
            let name = file_name(local)?;
            script.push_str(&format!(
                "put {} {}\n",
                quote(&local.display().to_string()),
                quote(&format!("{}/{}", dir, name))
            ));
        }
        script.push_str("bye\n");
        Ok(script)
    }

    async fn run_session(&self, script: &str) -> Result<(), DispatchError> {
        let mut child = Command::new(&self.config.sftp_binary)
            .args(self.build_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DispatchError::RemoteSpawn {
                binary: self.config.sftp_binary.clone(),
                source: e,
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            DispatchError::Io(std::io::Error::other("sftp stdin not captured"))
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            DispatchError::Io(std::io::Error::other("sftp stderr not captured"))
        })?;

        let result = timeout(self.config.timeout(), async {
            // A client that exits early closes the pipe; its exit status tells the story.
            let written = match stdin.write_all(script.as_bytes()).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e);
                }
            }
            drop(stdin);

            let mut error_output = String::new();
            stderr.read_to_string(&mut error_output).await?;
            let status = child.wait().await?;
            Ok::<(std::process::ExitStatus, String), std::io::Error>((status, error_output))
        })
        .await;

        match result {
            Ok(Ok((status, error_output))) => {
                if status.success() {
                    Ok(())
                } else {
                    Err(DispatchError::Remote {
                        host: self.config.host.clone(),
                        code: status.code(),
                        stderr: error_output.trim().chars().take(500).collect(),
                    })
                }
            }
            Ok(Err(e)) => Err(DispatchError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                Err(DispatchError::RemoteTimeout {
                    host: self.config.host.clone(),
                    secs: self.config.timeout_secs,
                })
            }
        }
    }

    async fn upload(&self, request: &DispatchRequest) -> Result<DispatchResult, DispatchError> {
        let mut bytes = 0u64;
        let mut files = 0usize;
        for path in request.files() {
            let meta = tokio::fs::metadata(path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DispatchError::SourceNotFound {
                        path: path.to_path_buf(),
                    }
                } else {
                    DispatchError::Io(e)
                }
            })?;
            bytes += meta.len();
            files += 1;
        }

        let script = self.build_script(request)?;
        debug!(host = %self.config.host, files, "Starting sftp session");
        self.run_session(&script).await?;

        // Only a clean exit proves every put succeeded.
        for path in request.files() {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!("Failed to remove uploaded file {}: {}", path.display(), e);
            }
        }

        let name = file_name(&request.artifact.path)?;
        Ok(DispatchResult {
            mode: StorageMode::Remote,
            destination: format!("{}:{}/{}", self.config.host, self.remote_dir(request), name),
            files,
            bytes,
        })
    }
}

#[async_trait]
impl StorageDispatcher for SftpDispatcher {
    fn mode(&self) -> StorageMode {
        StorageMode::Remote
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResult, DispatchError> {
        match self.upload(request).await {
            Ok(result) => {
                metrics::DISPATCHES_TOTAL
                    .with_label_values(&["remote", "success"])
                    .inc();
                info!(
                    image_id = %request.artifact.image_id,
                    destination = %result.destination,
                    bytes = result.bytes,
                    "Uploaded to remote storage"
                );
                Ok(result)
            }
            Err(e) => {
                metrics::DISPATCHES_TOTAL
                    .with_label_values(&["remote", "failed"])
                    .inc();
                Err(e)
            }
        }
    }
}

fn file_name(path: &Path) -> Result<&str, DispatchError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DispatchError::SourceNotFound {
            path: path.to_path_buf(),
        })
}

/// Double-quote a path for the sftp batch parser.
fn quote(path: &str) -> String {
    let escaped = path.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadArtifact;
    use crate::planner::Season;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn remote_config() -> RemoteStorageConfig {
        RemoteStorageConfig {
            host: "nas.local".to_string(),
            port: 2222,
            username: "planet".to_string(),
            identity_file: Some(PathBuf::from("/home/planet/.ssh/id_ed25519")),
            remote_dir: "/srv/imagery/".to_string(),
            sftp_binary: PathBuf::from("sftp"),
            ssh_options: vec!["StrictHostKeyChecking=accept-new".to_string()],
            timeout_secs: 5,
        }
    }

    fn request(path: PathBuf) -> DispatchRequest {
        DispatchRequest::new(
            DownloadArtifact {
                image_id: "img1".to_string(),
                path,
                bytes: 4,
                md5: String::new(),
                verified: true,
            },
            "B27",
            2021,
            Season::Lluvias,
        )
    }

    #[test]
    fn test_build_args() {
        let dispatcher = SftpDispatcher::new(remote_config());
        let args = dispatcher.build_args();
        assert_eq!(
            args,
            vec![
                "-b",
                "-",
                "-P",
                "2222",
                "-o",
                "BatchMode=yes",
                "-i",
                "/home/planet/.ssh/id_ed25519",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "planet@nas.local",
            ]
        );
    }

    #[test]
    fn test_build_script_creates_each_level() {
        let dispatcher = SftpDispatcher::new(remote_config());
        let req = request(PathBuf::from("/staging/B27/img1.tif"))
            .with_sidecars(vec![PathBuf::from("/staging/B27/img1.xml")]);

        let script = dispatcher.build_script(&req).unwrap();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(
            lines,
            vec![
                "-mkdir \"/srv/imagery\"",
                "-mkdir \"/srv/imagery/B27\"",
                "-mkdir \"/srv/imagery/B27/2021\"",
                "-mkdir \"/srv/imagery/B27/2021/lluvias\"",
                "put \"/staging/B27/img1.xml\" \"/srv/imagery/B27/2021/lluvias/img1.xml\"",
                "put \"/staging/B27/img1.tif\" \"/srv/imagery/B27/2021/lluvias/img1.tif\"",
                "bye",
            ]
        );
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("/a b/c"), "\"/a b/c\"");
        assert_eq!(quote("/a\"b"), "\"/a\\\"b\"");
    }

    #[test]
    fn test_remote_dir() {
        let dispatcher = SftpDispatcher::new(remote_config());
        let req = request(PathBuf::from("/staging/B27/img1.tif"));
        assert_eq!(dispatcher.remote_dir(&req), "/srv/imagery/B27/2021/lluvias");
    }

    #[tokio::test]
    async fn test_missing_binary_keeps_local_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img1.tif");
        tokio::fs::write(&path, b"data").await.unwrap();

        let mut config = remote_config();
        config.sftp_binary = PathBuf::from("/nonexistent/sftp-binary");
        let dispatcher = SftpDispatcher::new(config);

        let err = dispatcher.dispatch(&request(path.clone())).await.unwrap_err();
        assert!(matches!(err, DispatchError::RemoteSpawn { .. }));
        assert!(!err.is_retryable());
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_keeps_local_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img1.tif");
        tokio::fs::write(&path, b"data").await.unwrap();

        let mut config = remote_config();
        config.sftp_binary = PathBuf::from("false");
        let dispatcher = SftpDispatcher::new(config);

        let err = dispatcher.dispatch(&request(path.clone())).await.unwrap_err();
        assert!(matches!(err, DispatchError::Remote { code: Some(1), .. }));
        assert!(err.is_retryable());
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_zero_exit_removes_local_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img1.tif");
        tokio::fs::write(&path, b"data").await.unwrap();

        let mut config = remote_config();
        config.sftp_binary = PathBuf::from("true");
        let dispatcher = SftpDispatcher::new(config);

        let result = dispatcher.dispatch(&request(path.clone())).await.unwrap();
        assert_eq!(result.mode, StorageMode::Remote);
        assert_eq!(
            result.destination,
            "nas.local:/srv/imagery/B27/2021/lluvias/img1.tif"
        );
        assert_eq!(result.bytes, 4);
        assert!(!path.exists());
    }
}
