use std::path::PathBuf;

use anyhow::Context;
use tokio::io::AsyncWriteExt;

/// Identity of a supervised process, persisted so a restarted supervisor can find it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    pub name: String,
    pub started_at: u64,
}

impl PidRecord {
    pub fn encode(&self) -> String {
        format!(
            "pid={}\nname={}\nstarted_at={}\n",
            self.pid, self.name, self.started_at
        )
    }

    /// `pid` is required; unknown keys are ignored.
    pub fn decode(raw: &str) -> anyhow::Result<Self> {
        let mut pid = None;
        let mut name = None;
        let mut started_at = None;
        for line in raw.lines() {
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            let v = v.trim();
            match k.trim() {
                "pid" => {
                    pid = Some(
                        v.parse::<u32>()
                            .map_err(|_| anyhow::anyhow!("invalid pid: {v}"))?,
                    )
                }
                "name" => name = Some(v.to_string()),
                "started_at" => started_at = v.parse::<u64>().ok(),
                _ => {}
            }
        }

        let pid = pid.ok_or_else(|| anyhow::anyhow!("pid record has no pid"))?;
        if pid == 0 {
            anyhow::bail!("invalid pid: 0");
        }
        Ok(Self {
            pid,
            name: name.unwrap_or_else(|| "unknown".to_string()),
            started_at: started_at.unwrap_or(0),
        })
    }
}

/// Deterministic, filesystem-safe key for one game instance.
pub fn record_key(game: &str, instance: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("{}_{}", sanitize(game), sanitize(instance))
}

#[derive(Debug, Clone)]
pub struct PidStore {
    dir: PathBuf,
}

impl PidStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.pid"))
    }

    pub async fn save(&self, key: &str, record: &PidRecord) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create pid dir {}", self.dir.display()))?;

        let path = self.path_for(key);
        let tmp = path.with_extension("pid.tmp");
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(record.encode().as_bytes())
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        f.sync_all()
            .await
            .with_context(|| format!("sync {}", tmp.display()))?;
        drop(f);
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("persist {}", path.display()))?;
        Ok(())
    }

    pub async fn load(&self, key: &str) -> anyhow::Result<Option<PidRecord>> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        PidRecord::decode(&raw)
            .map(Some)
            .with_context(|| format!("parse {}", path.display()))
    }

    /// Missing records are fine.
    pub async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_format_is_key_value_lines() {
        let rec = PidRecord {
            pid: 4242,
            name: "valheim_server".to_string(),
            started_at: 1_700_000_000,
        };
        assert_eq!(
            rec.encode(),
            "pid=4242\nname=valheim_server\nstarted_at=1700000000\n"
        );
        assert_eq!(PidRecord::decode(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn decode_tolerates_missing_metadata() {
        let rec = PidRecord::decode("pid=17\n# hand edited\n").unwrap();
        assert_eq!(rec.pid, 17);
        assert_eq!(rec.name, "unknown");
        assert_eq!(rec.started_at, 0);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(PidRecord::decode("").is_err());
        assert!(PidRecord::decode("pid=abc\n").is_err());
        assert!(PidRecord::decode("pid=0\n").is_err());
    }

    #[test]
    fn key_is_lowercased_and_sanitized() {
        assert_eq!(
            record_key("Minecraft", "Vanilla Fabric 1.21.5"),
            "minecraft_vanilla_fabric_1_21_5"
        );
        assert_eq!(record_key("valheim", "Pantelimon"), "valheim_pantelimon");
        assert_eq!(record_key("a/b", "../x"), "a_b____x");
    }

    #[tokio::test]
    async fn save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = PidStore::new(dir.path().join("pids"));
        let key = record_key("valheim", "Pantelimon");

        assert_eq!(store.load(&key).await.unwrap(), None);

        let rec = PidRecord {
            pid: 99,
            name: "zsh".to_string(),
            started_at: 12,
        };
        store.save(&key, &rec).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), Some(rec));
        assert!(!store.path_for(&key).with_extension("pid.tmp").exists());

        store.remove(&key).await.unwrap();
        store.remove(&key).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_replaces_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = PidStore::new(dir.path());
        let first = PidRecord {
            pid: 1000,
            name: "a".to_string(),
            started_at: 1,
        };
        let second = PidRecord {
            pid: 2000,
            name: "b".to_string(),
            started_at: 2,
        };
        store.save("k", &first).await.unwrap();
        store.save("k", &second).await.unwrap();
        assert_eq!(store.load("k").await.unwrap(), Some(second));
    }
}
