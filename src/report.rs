use crate::snapshot::Snapshot;
use chrono::NaiveDateTime;
use std::fmt::{Display, Write as _};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const JSON_HEADER: &str = "=== System Info (JSON) ===";
pub const READABLE_HEADER: &str = "=== System Info (Readable) ===";

pub const HOST_ID_ENV_VARS: [&str; 2] = ["USERDOMAIN", "COMPUTERNAME"];

const FORBIDDEN_FILENAME_CHARS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("не удалось сериализовать снимок: {0}")]
    Json(#[from] serde_json::Error),
    #[error("не удалось записать файл {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("в файле отсутствует секция: {0}")]
    MissingSection(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
}

impl Artifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

pub fn render_json(snapshot: &Snapshot) -> Result<String, ReportError> {
    Ok(serde_json::to_string_pretty(snapshot)?)
}

pub fn render_digest(snapshot: &Snapshot) -> String {
    let platform = snapshot.platform.as_ok();
    let memory = snapshot.memory.as_ok();
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Система: {} {}",
        opt(platform.map(|p| &p.system)),
        opt(platform.map(|p| &p.release))
    );
    let _ = writeln!(out, "Машина: {}", opt(platform.map(|p| &p.machine)));
    let _ = writeln!(out, "Процессор: {}", opt(platform.map(|p| &p.processor)));
    let _ = writeln!(out, "Имя хоста: {}", opt(snapshot.hostname.as_ref()));
    let _ = writeln!(out, "Локальный IP: {}", opt(snapshot.local_ip.as_ref()));
    let _ = writeln!(
        out,
        "Всего памяти (байт): {}",
        opt(memory.map(|m| m.total_bytes))
    );
    let _ = writeln!(
        out,
        "Использование памяти (%): {}",
        memory
            .map(|m| format!("{:?}", m.percent))
            .unwrap_or_else(|| "None".to_string())
    );
    out.push_str("Диски:\n");
    if let Some(err) = snapshot.disks.error() {
        let _ = writeln!(out, "  (ошибка: {err})");
    }
    for d in snapshot.disks.as_ok().into_iter().flatten() {
        let _ = writeln!(
            out,
            "  - {} смонтирован в {}, тип {}",
            d.device, d.mountpoint, d.fstype
        );
    }
    out
}

pub fn serialize(snapshot: &Snapshot) -> Result<String, ReportError> {
    let json = render_json(snapshot)?;
    let digest = render_digest(snapshot);
    Ok(format!(
        "{JSON_HEADER}\n{json}\n\n{READABLE_HEADER}\n{digest}"
    ))
}

pub fn parse_structured(layout: &str) -> Result<Snapshot, ReportError> {
    let body = layout
        .strip_prefix(JSON_HEADER)
        .and_then(|rest| rest.strip_prefix('\n'))
        .ok_or(ReportError::MissingSection(JSON_HEADER))?;
    let end = body
        .find(&format!("\n\n{READABLE_HEADER}\n"))
        .ok_or(ReportError::MissingSection(READABLE_HEADER))?;
    Ok(serde_json::from_str(&body[..end])?)
}

pub fn sanitize_host_id(host_id: &str) -> String {
    host_id
        .chars()
        .map(|c| {
            if FORBIDDEN_FILENAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect()
}

pub fn artifact_name(host_id: &str, at: &NaiveDateTime) -> String {
    format!(
        "{}_{}.txt",
        sanitize_host_id(host_id),
        at.format("%d-%m-%Y_%H-%M")
    )
}

pub fn resolve_host_id(
    lookup: impl Fn(&str) -> Option<String>,
    local_hostname: impl FnOnce() -> String,
) -> String {
    HOST_ID_ENV_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .find(|v| !v.is_empty())
        .unwrap_or_else(local_hostname)
}

pub fn persist(layout: &str, dir: &Path, name: &str) -> Result<Artifact, ReportError> {
    fs::create_dir_all(dir).map_err(|source| ReportError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    let path = dir.join(name);
    fs::write(&path, layout.as_bytes()).map_err(|source| ReportError::Io {
        path: path.display().to_string(),
        source,
    })?;
    info!(path = %path.display(), bytes = layout.len(), "отчёт записан");
    Ok(Artifact { path })
}

fn opt<T: Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "None".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::fake::FakeProbe;
    use crate::collectors::{collect, CollectOptions};
    use chrono::NaiveDate;
    use std::time::Duration;

    fn sample_snapshot() -> Snapshot {
        let mut probe = FakeProbe::healthy();
        probe.denied_mounts.insert("/media/cdrom".to_string());
        probe.failing.insert("net_io");
        collect(
            &mut probe,
            &CollectOptions {
                cpu_sample_interval: Duration::from_millis(1),
                top_process_limit: 5,
            },
        )
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 17)
            .unwrap()
    }

    #[test]
    fn artifact_name_uses_day_first_minute_precision() {
        assert_eq!(
            artifact_name("HOST1", &at(2025, 9, 30, 22, 53)),
            "HOST1_30-09-2025_22-53.txt"
        );
        assert_eq!(
            artifact_name("PC", &at(2024, 1, 2, 3, 4)),
            "PC_02-01-2024_03-04.txt"
        );
    }

    #[test]
    fn sanitize_replaces_only_forbidden_chars() {
        assert_eq!(
            sanitize_host_id(r#"a\b/c:d*e?f"g<h>i|j"#),
            "a_b_c_d_e_f_g_h_i_j"
        );
        assert_eq!(sanitize_host_id("DESKTOP-UP2V8.corp_é 1"), "DESKTOP-UP2V8.corp_é 1");
    }

    #[test]
    fn host_id_fallback_chain() {
        let env = |vars: &'static [(&'static str, &'static str)]| {
            move |name: &str| {
                vars.iter()
                    .find(|(k, _)| *k == name)
                    .map(|(_, v)| v.to_string())
            }
        };
        assert_eq!(
            resolve_host_id(env(&[("USERDOMAIN", "CORP"), ("COMPUTERNAME", "PC1")]), || {
                "box".to_string()
            }),
            "CORP"
        );
        assert_eq!(
            resolve_host_id(env(&[("USERDOMAIN", ""), ("COMPUTERNAME", "PC1")]), || {
                "box".to_string()
            }),
            "PC1"
        );
        assert_eq!(resolve_host_id(env(&[]), || "box".to_string()), "box");
    }

    #[test]
    fn layout_has_both_sections_in_order() {
        let layout = serialize(&sample_snapshot()).unwrap();
        assert!(layout.starts_with("=== System Info (JSON) ===\n{\n  \"timestamp\""));
        let json_at = layout.find(JSON_HEADER).unwrap();
        let readable_at = layout.find("\n\n=== System Info (Readable) ===\n").unwrap();
        assert!(json_at < readable_at);
        assert!(layout.contains("Имя хоста: HOST1\n"));
        assert!(layout.contains("Использование памяти (%): 50.0\n"));
        assert!(layout.contains("  - /dev/sdb1 смонтирован в /data, тип ext4\n"));
    }

    #[test]
    fn json_keeps_non_ascii_literal() {
        let json = render_json(&sample_snapshot()).unwrap();
        assert!(json.contains("AMD Ryzen™ 7 5800X"));
        assert!(!json.contains("\\u2122"));
    }

    #[test]
    fn structured_section_round_trips() {
        let snapshot = sample_snapshot();
        let layout = serialize(&snapshot).unwrap();
        let parsed = parse_structured(&layout).unwrap();
        assert_eq!(parsed, snapshot);
        assert!(parsed.net_io.is_failed());
        let disks = parsed.disks.as_ok().unwrap();
        assert!(disks[2].usage.is_none());
    }

    #[test]
    fn parse_rejects_layout_without_sections() {
        assert!(matches!(
            parse_structured("{}"),
            Err(ReportError::MissingSection(_))
        ));
        assert!(matches!(
            parse_structured("=== System Info (JSON) ===\n{}"),
            Err(ReportError::MissingSection(_))
        ));
    }

    #[test]
    fn digest_renders_failed_categories_as_none() {
        let mut probe = FakeProbe::healthy();
        probe.failing.insert("memory");
        probe.failing.insert("disks");
        probe.hostname = None;
        let snapshot = collect(&mut probe, &CollectOptions::default());
        let digest = render_digest(&snapshot);
        assert!(digest.contains("Имя хоста: None\n"));
        assert!(digest.contains("Всего памяти (байт): None\n"));
        assert!(digest.contains("Диски:\n  (ошибка: "));
    }

    #[test]
    fn persist_writes_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested");
        let first = persist("one", &target, "HOST1_30-09-2025_22-53.txt").unwrap();
        let second = persist("two", &target, "HOST1_30-09-2025_22-53.txt").unwrap();
        assert_eq!(first, second);
        assert_eq!(second.file_name(), "HOST1_30-09-2025_22-53.txt");
        assert_eq!(fs::read_to_string(&second.path).unwrap(), "two");
    }

    #[test]
    fn persist_fails_on_unwritable_storage() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let err = persist("data", &blocker, "out.txt").unwrap_err();
        assert!(matches!(err, ReportError::Io { .. }));
    }
}
