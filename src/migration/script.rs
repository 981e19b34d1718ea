//! Migration script discovery and parsing.
//!
//! A script is `<version>_<name>.sql`. Its forward SQL runs up to a line
//! `-- rollback:` (or `-- down:`); everything after that line, plus any SQL
//! written inline after the colon, is the rollback. Rollback statements may be
//! commented out with `-- ` so the file stays runnable as-is: a commented line is
//! uncommented when it starts a statement (`DROP TABLE`, `ALTER TABLE`, `DELETE FROM`,
//! ...) or continues one not yet closed by `;`. Any other commented line, such as
//! `-- drop the table last`, stays a comment.

use crate::error::AppError;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const FILE_PATTERN: &str = r"^(\d+)_([A-Za-z0-9][A-Za-z0-9_\-]*)\.sql$";

#[derive(Clone, Debug, PartialEq)]
pub struct MigrationScript {
    pub version: i64,
    pub name: String,
    pub path: PathBuf,
    pub forward: String,
    pub rollback: String,
    /// SHA-256 hex of the whole file.
    pub checksum: String,
}

impl MigrationScript {
    /// Parse file contents. Fails when there is no forward SQL or no rollback section.
    pub fn parse(version: i64, name: &str, path: PathBuf, content: &str) -> Result<Self, AppError> {
        let invalid = |reason: &str| {
            AppError::Migration(format!("{}: {}", path.display(), reason))
        };
        let (forward, rollback) = split_rollback(content).ok_or_else(|| invalid("missing '-- rollback:' section"))?;
        if forward.trim().is_empty() {
            return Err(invalid("no forward statements"));
        }
        if !has_statements(&rollback) {
            return Err(invalid("empty rollback section"));
        }
        Ok(MigrationScript {
            version,
            name: name.to_string(),
            checksum: checksum(content),
            forward,
            rollback,
            path,
        })
    }
}

pub fn checksum(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Split into (forward, rollback) at the first rollback marker line.
fn split_rollback(content: &str) -> Option<(String, String)> {
    let lines: Vec<&str> = content.lines().collect();
    let (at, inline) = lines
        .iter()
        .enumerate()
        .find_map(|(i, line)| rollback_marker(line).map(|inline| (i, inline)))?;

    let forward = lines[..at].join("\n");
    let mut rollback: Vec<&str> = Vec::new();
    let mut open = false;
    if !inline.is_empty() {
        rollback.push(inline);
        open = !inline.ends_with(';');
    }
    for line in lines[at + 1..].iter().copied() {
        let trimmed = line.trim_start();
        let commented = trimmed
            .strip_prefix("-- ")
            .or_else(|| trimmed.strip_prefix("--"));
        let sql = match commented {
            Some(text) if open || starts_statement(text) => text,
            Some(_) => {
                rollback.push(line);
                continue;
            }
            None => line,
        };
        if !sql.trim().is_empty() {
            open = !sql.trim_end().ends_with(';');
        }
        rollback.push(sql);
    }
    Some((forward.trim().to_string(), rollback.join("\n").trim().to_string()))
}

/// Whether `text` opens a DDL/DML statement, judged by its first two words.
fn starts_statement(text: &str) -> bool {
    const OBJECTS: &[&str] = &[
        "TABLE", "INDEX", "TYPE", "SEQUENCE", "VIEW", "MATERIALIZED", "SCHEMA", "FUNCTION",
        "PROCEDURE", "TRIGGER", "EXTENSION", "DOMAIN", "POLICY", "RULE", "UNIQUE", "OR",
        "TEMP", "TEMPORARY", "UNLOGGED",
    ];
    let words: Vec<String> = text
        .split_whitespace()
        .take(2)
        .map(|w| w.trim_end_matches(';').to_ascii_uppercase())
        .collect();
    let second = words.get(1).map(String::as_str).unwrap_or("");
    match words.first().map(String::as_str) {
        Some("DROP" | "CREATE" | "ALTER") => OBJECTS.contains(&second),
        Some("DELETE") => second == "FROM",
        Some("INSERT") => second == "INTO",
        Some("COMMENT") => second == "ON",
        Some("UPDATE") => text
            .split_whitespace()
            .any(|w| w.eq_ignore_ascii_case("SET")),
        Some("TRUNCATE" | "GRANT" | "REVOKE") => !second.is_empty(),
        _ => false,
    }
}

/// True when `sql` holds something besides blank lines and `--` comments.
fn has_statements(sql: &str) -> bool {
    sql.lines().any(|l| {
        let l = l.trim();
        !l.is_empty() && !l.starts_with("--")
    })
}

/// Inline SQL after the marker if `line` is `-- rollback:` / `-- down:` (any case).
fn rollback_marker(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix("--")?.trim_start();
    let lower = rest.to_ascii_lowercase();
    let keyword_len = if lower.starts_with("rollback:") {
        "rollback:".len()
    } else if lower.starts_with("down:") {
        "down:".len()
    } else {
        return None;
    };
    Some(rest[keyword_len..].trim())
}

/// All scripts in `dir`, ascending by version. Files without the `.sql` extension are ignored.
pub fn discover(dir: &Path) -> Result<Vec<MigrationScript>, AppError> {
    let pattern = Regex::new(FILE_PATTERN).map_err(|e| AppError::Migration(e.to_string()))?;
    let entries = fs::read_dir(dir).map_err(|e| {
        AppError::Migration(format!("cannot read migrations directory {}: {}", dir.display(), e))
    })?;

    let mut scripts: Vec<MigrationScript> = Vec::new();
    let mut seen: HashMap<i64, PathBuf> = HashMap::new();
    for entry in entries {
        let path = entry
            .map_err(|e| AppError::Migration(format!("{}: {}", dir.display(), e)))?
            .path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let caps = pattern.captures(file_name).ok_or_else(|| {
            AppError::Migration(format!(
                "migration file '{}' does not match <version>_<name>.sql",
                file_name
            ))
        })?;
        let version: i64 = caps[1]
            .parse()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| AppError::Migration(format!("invalid version in '{}'", file_name)))?;
        let name = caps[2].to_string();

        if let Some(previous) = seen.insert(version, path.clone()) {
            return Err(AppError::Migration(format!(
                "duplicate migration version {}: {} and {}",
                version,
                previous.display(),
                path.display()
            )));
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| AppError::Migration(format!("cannot read {}: {}", path.display(), e)))?;
        scripts.push(MigrationScript::parse(version, &name, path, &content)?);
    }
    scripts.sort_by_key(|s| s.version);
    tracing::debug!(dir = %dir.display(), count = scripts.len(), "discovered migrations");
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pgcrud-{}-{}", tag, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn rollback_section_is_split_and_uncommented() {
        let content = "CREATE TABLE users (user_id TEXT PRIMARY KEY);\n\n-- Rollback:\n-- DROP TABLE users;\n";
        let s = MigrationScript::parse(1, "users", PathBuf::from("001_users.sql"), content).unwrap();
        assert_eq!(s.forward, "CREATE TABLE users (user_id TEXT PRIMARY KEY);");
        assert_eq!(s.rollback, "DROP TABLE users;");
        assert_eq!(s.checksum.len(), 64);
    }

    #[test]
    fn prose_in_the_rollback_section_stays_a_comment() {
        let content = "CREATE TABLE t (id INT);\n\
                       CREATE TABLE u (id INT);\n\
                       -- rollback:\n\
                       -- Drop the child before the parent.\n\
                       -- DROP TABLE u;\n\
                       -- ALTER TABLE t\n\
                       --   DROP COLUMN id;\n\
                       -- done\n\
                       -- drop table t;\n";
        let s = MigrationScript::parse(3, "t", PathBuf::from("003_t.sql"), content).unwrap();
        assert_eq!(
            s.rollback,
            "-- Drop the child before the parent.\nDROP TABLE u;\nALTER TABLE t\n  DROP COLUMN id;\n-- done\ndrop table t;"
        );
    }

    #[test]
    fn rollback_of_only_comments_is_rejected() {
        let content = "CREATE TABLE t (id INT);\n-- rollback:\n-- nothing to undo here\n";
        let err = MigrationScript::parse(4, "t", PathBuf::from("004_t.sql"), content).unwrap_err();
        assert!(matches!(err, AppError::Migration(ref m) if m.contains("empty rollback")));
    }

    #[test]
    fn inline_rollback_after_marker() {
        let content = "CREATE INDEX i ON t (c);\n-- down: DROP INDEX i;\n";
        let s = MigrationScript::parse(2, "idx", PathBuf::from("002_idx.sql"), content).unwrap();
        assert_eq!(s.rollback, "DROP INDEX i;");
    }

    #[test]
    fn script_without_rollback_is_rejected() {
        let err = MigrationScript::parse(3, "x", PathBuf::from("003_x.sql"), "CREATE TABLE x (id INT);").unwrap_err();
        assert!(matches!(err, AppError::Migration(ref m) if m.contains("rollback")));
    }

    #[test]
    fn checksum_changes_with_any_byte() {
        assert_ne!(checksum("SELECT 1;"), checksum("SELECT 1; "));
        assert_eq!(checksum("SELECT 1;"), checksum("SELECT 1;"));
    }

    #[test]
    fn discovery_orders_by_version_and_ignores_other_files() {
        let dir = scratch_dir("discover");
        fs::write(dir.join("010_events.sql"), "CREATE TABLE e (id INT);\n-- rollback: DROP TABLE e;").unwrap();
        fs::write(dir.join("2_users.sql"), "CREATE TABLE u (id INT);\n-- rollback: DROP TABLE u;").unwrap();
        fs::write(dir.join("README.md"), "notes").unwrap();

        let scripts = discover(&dir).unwrap();
        let versions: Vec<i64> = scripts.iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![2, 10]);
        assert_eq!(scripts[1].name, "events");
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn duplicate_versions_are_rejected() {
        let dir = scratch_dir("dup");
        fs::write(dir.join("001_a.sql"), "SELECT 1;\n-- rollback: SELECT 1;").unwrap();
        fs::write(dir.join("1_b.sql"), "SELECT 1;\n-- rollback: SELECT 1;").unwrap();
        let err = discover(&dir).unwrap_err();
        assert!(matches!(err, AppError::Migration(ref m) if m.contains("duplicate")));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn misnamed_sql_files_are_rejected() {
        let dir = scratch_dir("misnamed");
        fs::write(dir.join("users.sql"), "SELECT 1;\n-- rollback: SELECT 1;").unwrap();
        assert!(discover(&dir).is_err());
        fs::remove_dir_all(dir).unwrap();
    }
}
