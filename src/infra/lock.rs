//! 部署锁
//!
//! 工作目录和服务单元是宿主机上的单例，同一时间只允许一次部署。
//! 使用锁文件上的 `flock(LOCK_EX)` 在进程间互斥，锁随 [`DeployLock`] drop 释放。

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 部署锁错误
#[derive(Debug, Error)]
pub enum LockError {
    #[error("another deployment holds the lock at {}", .0.display())]
    Busy(PathBuf),

    #[error("failed to lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 持有期间独占部署锁
#[derive(Debug)]
pub struct DeployLock {
    file: File,
    path: PathBuf,
}

impl DeployLock {
    /// 尝试获取锁，已被占用时立即返回 [`LockError::Busy`]
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let file = open_lock_file(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(LockError::Busy(path));
            }
            return Err(LockError::Io { path, source: e });
        }

        Ok(Self::locked(file, path))
    }

    /// 阻塞等待直到获得锁
    ///
    /// 并发触发的部署因此排队执行，而不是互相覆盖
    pub async fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let join_path = path.clone();

        tokio::task::spawn_blocking(move || {
            let file = open_lock_file(&path)?;
            file.lock_exclusive()
                .map_err(|source| LockError::Io {
                    path: path.clone(),
                    source,
                })?;
            Ok(Self::locked(file, path))
        })
        .await
        .map_err(|e| LockError::Io {
            path: join_path,
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
    }

    fn locked(mut file: File, path: PathBuf) -> Self {
        // 写入持有者 pid，便于排查；失败不影响锁本身
        if file.set_len(0).is_ok() {
            let _ = writeln!(file, "{}", std::process::id());
        }
        tracing::debug!(path = %path.display(), "Deployment lock acquired");
        Self { file, path }
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        tracing::debug!(path = %self.path.display(), "Deployment lock released");
    }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }
    let opened = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path);

    // 锁文件由其他用户创建时只读打开，flock 不要求写权限
    let opened = match opened {
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => File::open(path),
        other => other,
    };
    opened.map_err(|source| LockError::Io {
        path: path.to_path_buf(),
        source,
    })
}
