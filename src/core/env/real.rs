// src/core/env/real.rs

//! The production `Environment`: a cluster filesystem rooted at a local
//! directory (pmxcfs-style mount point in real deployments), a watchdog-mux
//! Unix socket, and fence agents invoked as subprocesses.

use crate::core::config_model::FenceDeviceConfig;
use crate::core::env::{Environment, FenceExit};
use crate::core::errors::{ClusterHaError, Result};
use crate::core::notify::FencingEvent;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::process::Command;

/// Path the LRM writes to / pings, per spec §6 ("Watchdog").
pub const WATCHDOG_SOCKET: &str = "/run/watchdog-mux.sock";

pub struct RealEnvironment {
    /// Root of the cluster-filesystem mount (e.g. `/etc/pve`).
    base_dir: PathBuf,
    watchdog_socket: PathBuf,
}

impl RealEnvironment {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            watchdog_socket: PathBuf::from(WATCHDOG_SOCKET),
        }
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        self.base_dir.join(rel)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.base_dir.join("priv/lock").join(name)
    }

    async fn atomic_write(path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

#[async_trait]
impl Environment for RealEnvironment {
    fn now(&self) -> u64 {
        Self::now_secs()
    }

    async fn quorate(&self) -> bool {
        match tokio::fs::read_to_string(self.resolve("cluster/quorate")).await {
            Ok(s) => s.trim() == "1",
            Err(_) => true,
        }
    }

    async fn online_nodes(&self) -> HashSet<String> {
        match tokio::fs::read_to_string(self.resolve("cluster/members.json")).await {
            Ok(s) => serde_json::from_str::<Vec<String>>(&s)
                .unwrap_or_default()
                .into_iter()
                .collect(),
            Err(_) => HashSet::new(),
        }
    }

    async fn kv_read(&self, path: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.resolve(path)).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn kv_write(&self, path: &str, contents: String) -> Result<()> {
        if !self.quorate().await {
            return Err(ClusterHaError::QuorumLost);
        }
        Self::atomic_write(&self.resolve(path), &contents).await
    }

    async fn kv_append_line(&self, path: &str, line: String) -> Result<()> {
        if !self.quorate().await {
            return Err(ClusterHaError::QuorumLost);
        }
        let full = self.resolve(path);
        let mut existing = tokio::fs::read_to_string(&full).await.unwrap_or_default();
        if !existing.is_empty() && !existing.ends_with('\n') {
            existing.push('\n');
        }
        existing.push_str(&line);
        existing.push('\n');
        Self::atomic_write(&full, &existing).await
    }

    async fn lock_try_acquire(&self, name: &str, owner: &str, lifetime_secs: u64) -> Result<bool> {
        let path = self.lock_path(name);
        if let Ok(existing) = tokio::fs::read_to_string(&path).await {
            let mut lines = existing.lines();
            let held_by = lines.next().unwrap_or_default();
            let expires_at: u64 = lines.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            if held_by != owner && Self::now_secs() < expires_at {
                return Ok(false);
            }
        }
        let contents = format!("{owner}\n{}\n", Self::now_secs() + lifetime_secs);
        Self::atomic_write(&path, &contents).await?;
        Ok(true)
    }

    async fn lock_refresh(&self, name: &str, owner: &str, lifetime_secs: u64) -> Result<bool> {
        let path = self.lock_path(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(existing) => {
                let held_by = existing.lines().next().unwrap_or_default();
                if held_by != owner {
                    return Ok(false);
                }
                let contents = format!("{owner}\n{}\n", Self::now_secs() + lifetime_secs);
                Self::atomic_write(&path, &contents).await?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn lock_release(&self, name: &str, owner: &str) {
        let path = self.lock_path(name);
        if let Ok(existing) = tokio::fs::read_to_string(&path).await
            && existing.lines().next() == Some(owner)
        {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    async fn lock_steal(&self, name: &str, new_owner: &str, lifetime_secs: u64) -> Result<bool> {
        let path = self.lock_path(name);
        if let Ok(existing) = tokio::fs::read_to_string(&path).await {
            let expires_at: u64 = existing
                .lines()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            if Self::now_secs() < expires_at {
                return Ok(false);
            }
        }
        let contents = format!("{new_owner}\n{}\n", Self::now_secs() + lifetime_secs);
        Self::atomic_write(&path, &contents).await?;
        Ok(true)
    }

    async fn lock_is_held_by(&self, name: &str, owner: &str) -> bool {
        match tokio::fs::read_to_string(self.lock_path(name)).await {
            Ok(existing) => existing.lines().next() == Some(owner),
            Err(_) => false,
        }
    }

    async fn watchdog_ping(&self) -> Result<()> {
        let mut sock = UnixStream::connect(&self.watchdog_socket).await?;
        sock.write_all(&[0u8]).await?;
        Ok(())
    }

    async fn watchdog_close(&self, graceful: bool) -> Result<()> {
        let mut sock = UnixStream::connect(&self.watchdog_socket).await?;
        if graceful {
            sock.write_all(b"V").await?;
        }
        // Dropping without writing 'V' leaves the watchdog armed, forcing a
        // reboot within the hardware timeout (spec §6).
        Ok(())
    }

    async fn fence_device(&self, device: &FenceDeviceConfig, node: &str) -> FenceExit {
        let mut cmd = Command::new(&device.agent);
        cmd.arg(format!("--plug={node}"));
        for (key, val) in &device.params {
            cmd.arg(format!("--{key}={val}"));
        }
        let fut = cmd.output();
        match tokio::time::timeout(std::time::Duration::from_secs(device.timeout_secs), fut).await
        {
            Ok(Ok(output)) => FenceExit::from_raw(output.status.code().unwrap_or(-1)),
            _ => FenceExit::Failure,
        }
    }

    async fn notify_fencing(&self, event: FencingEvent) {
        tracing::info!(?event, "fencing notification");
    }
}
