use std::path::{Component, Path, PathBuf};

use sqlx::SqlitePool;

use crate::evolve::patch::{Patch, PatchError, apply_exact};
use crate::types::SourceFile;

/// Top-level entries of the source root that are persisted.
const TREE_ROOTS: &[&str] = &["Cargo.toml", "crates", "migrations"];
const EXTENSIONS: &[&str] = &["rs", "toml", "sql", "md"];
const SKIP_DIRS: &[&str] = &["target", ".git", "data"];

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("source file not found: {0}")]
    MissingFile(String),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

#[derive(sqlx::FromRow)]
struct SourceRow {
    id: i64,
    filepath: String,
    content: String,
    version: i64,
}

impl From<SourceRow> for SourceFile {
    fn from(row: SourceRow) -> Self {
        Self { id: row.id, filepath: row.filepath, content: row.content, version: row.version }
    }
}

/// Walk `root` and collect `(relative path, content)` for every persisted file.
/// Paths use `/` separators regardless of platform.
pub fn collect_tree(root: &Path) -> std::io::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for entry in TREE_ROOTS {
        let path = root.join(entry);
        if path.is_file() {
            push_file(root, &path, &mut out)?;
        } else if path.is_dir() {
            walk(root, &path, &mut out)?;
        }
    }
    out.sort();
    Ok(out)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, String)>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if !SKIP_DIRS.contains(&name) {
                walk(root, &path, out)?;
            }
        } else {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            if EXTENSIONS.contains(&ext) {
                push_file(root, &path, out)?;
            }
        }
    }
    Ok(())
}

fn push_file(root: &Path, path: &Path, out: &mut Vec<(String, String)>) -> std::io::Result<()> {
    let Ok(rel) = path.strip_prefix(root) else {
        return Ok(());
    };
    let rel = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    match std::fs::read_to_string(path) {
        Ok(content) => out.push((rel, content)),
        // non-UTF-8 files are not persisted
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {}
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Insert `files` only if the table is empty. Returns the number inserted.
pub async fn seed(pool: &SqlitePool, files: &[(String, String)]) -> Result<usize, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let (existing,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM source_files")
        .fetch_one(&mut *tx)
        .await?;
    if existing > 0 {
        return Ok(0);
    }
    for (path, content) in files {
        sqlx::query("INSERT INTO source_files (filepath, content) VALUES (?, ?)")
            .bind(path)
            .bind(content)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(files.len())
}

pub async fn fetch(pool: &SqlitePool, filepath: &str) -> Result<Option<SourceFile>, sqlx::Error> {
    let row: Option<SourceRow> =
        sqlx::query_as("SELECT id, filepath, content, version FROM source_files WHERE filepath = ?")
            .bind(filepath)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(Into::into))
}

pub async fn fetch_all(pool: &SqlitePool) -> Result<Vec<SourceFile>, sqlx::Error> {
    let rows: Vec<SourceRow> =
        sqlx::query_as("SELECT id, filepath, content, version FROM source_files ORDER BY filepath")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Apply a verified patch and delete the failure it resolves, in one
/// transaction. The replacement is recomputed against the row read inside
/// the transaction. Returns the new version.
pub async fn apply_patch_and_resolve(
    pool: &SqlitePool,
    patch: &Patch,
    failure_id: i64,
) -> Result<i64, ApplyError> {
    let mut tx = pool.begin().await?;
    let row: Option<SourceRow> =
        sqlx::query_as("SELECT id, filepath, content, version FROM source_files WHERE filepath = ?")
            .bind(&patch.file)
            .fetch_optional(&mut *tx)
            .await?;
    let Some(row) = row else {
        return Err(ApplyError::MissingFile(patch.file.clone()));
    };
    let patched = apply_exact(&row.content, &patch.old_code, &patch.new_code)?;
    let version = row.version + 1;
    sqlx::query("UPDATE source_files SET content = ?, version = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(&patched)
        .bind(version)
        .bind(row.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM failures WHERE id = ?")
        .bind(failure_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(version)
}

/// Resolve a stored relative path under `dir`, refusing anything that would
/// escape it.
pub fn confined_path(dir: &Path, relative: &str) -> Option<PathBuf> {
    let rel = Path::new(relative);
    if rel.components().all(|c| matches!(c, Component::Normal(_))) {
        Some(dir.join(rel))
    } else {
        None
    }
}

/// Write `files` under `dir`, creating parent directories.
pub fn write_tree<'a>(
    dir: &Path,
    files: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> std::io::Result<usize> {
    let mut written = 0;
    for (relative, content) in files {
        let Some(path) = confined_path(dir, relative) else {
            tracing::warn!(path = relative, "skipping source path outside tree");
            continue;
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        written += 1;
    }
    Ok(written)
}

/// Write the persisted tree to `dir` for an external supervisor to rebuild.
pub async fn export_to(pool: &SqlitePool, dir: &Path) -> anyhow::Result<usize> {
    let files = fetch_all(pool).await?;
    let dir = dir.to_path_buf();
    let written = tokio::task::spawn_blocking(move || {
        write_tree(&dir, files.iter().map(|f| (f.filepath.as_str(), f.content.as_str())))
    })
    .await??;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> Vec<(String, String)> {
        vec![("crates/core/src/a.rs".into(), "fn a() { 1 }".into())]
    }

    #[tokio::test]
    async fn seed_only_when_empty() {
        let pool = crate::store::in_memory().await.unwrap();
        assert_eq!(seed(&pool, &files()).await.unwrap(), 1);
        assert_eq!(seed(&pool, &files()).await.unwrap(), 0);
        assert_eq!(fetch_all(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_matching_patch_leaves_file_untouched() {
        let pool = crate::store::in_memory().await.unwrap();
        seed(&pool, &files()).await.unwrap();
        let patch = Patch {
            file: "crates/core/src/a.rs".into(),
            old_code: "fn b()".into(),
            new_code: "fn c()".into(),
        };
        let err = apply_patch_and_resolve(&pool, &patch, 1).await.unwrap_err();
        assert!(matches!(err, ApplyError::Patch(PatchError::NotFound)));
        let file = fetch(&pool, "crates/core/src/a.rs").await.unwrap().unwrap();
        assert_eq!(file.version, 1);
        assert_eq!(file.content, "fn a() { 1 }");
    }

    #[tokio::test]
    async fn applied_patch_bumps_version_and_clears_failure() {
        let pool = crate::store::in_memory().await.unwrap();
        seed(&pool, &files()).await.unwrap();
        crate::store::failures::upsert(
            &pool,
            &[crate::store::failures::FailureSample {
                pattern: "cargo".into(),
                example: "cargo x".into(),
                error: "e".into(),
            }],
        )
        .await
        .unwrap();
        let failure = crate::store::failures::top(&pool).await.unwrap().unwrap();
        let patch = Patch {
            file: "crates/core/src/a.rs".into(),
            old_code: "{ 1 }".into(),
            new_code: "{ 2 }".into(),
        };
        let version = apply_patch_and_resolve(&pool, &patch, failure.id).await.unwrap();
        assert_eq!(version, 2);
        assert_eq!(fetch(&pool, &patch.file).await.unwrap().unwrap().content, "fn a() { 2 }");
        assert!(crate::store::failures::top(&pool).await.unwrap().is_none());
    }

    #[test]
    fn paths_cannot_escape_the_tree() {
        let dir = Path::new("/tmp/tree");
        assert!(confined_path(dir, "crates/x.rs").is_some());
        assert!(confined_path(dir, "../etc/passwd").is_none());
        assert!(confined_path(dir, "/etc/passwd").is_none());
    }

    #[test]
    fn collect_and_write_tree() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("crates/core/src")).unwrap();
        std::fs::create_dir_all(src.path().join("crates/core/target")).unwrap();
        std::fs::write(src.path().join("Cargo.toml"), "[workspace]").unwrap();
        std::fs::write(src.path().join("crates/core/src/lib.rs"), "pub mod x;").unwrap();
        std::fs::write(src.path().join("crates/core/src/notes.bin"), "x").unwrap();
        std::fs::write(src.path().join("crates/core/target/gen.rs"), "x").unwrap();

        let tree = collect_tree(src.path()).unwrap();
        let paths: Vec<_> = tree.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["Cargo.toml", "crates/core/src/lib.rs"]);

        let out = tempfile::tempdir().unwrap();
        let n = write_tree(out.path(), tree.iter().map(|(p, c)| (p.as_str(), c.as_str()))).unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            std::fs::read_to_string(out.path().join("crates/core/src/lib.rs")).unwrap(),
            "pub mod x;"
        );
    }
}
