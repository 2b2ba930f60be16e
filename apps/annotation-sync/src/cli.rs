//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Keep annotation blocks in a Markdown directory in sync with a card database.
#[derive(Parser, Debug, Clone)]
#[command(name = "annotation-sync")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory of annotated documents
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Run one full sync pass, print the report as JSON and exit
    #[arg(long)]
    pub once: bool,

    /// Card database path (default: local data dir)
    #[arg(long, env = "ANNOTATION_SYNC_DB")]
    pub db: Option<PathBuf>,
}

impl Args {
    pub fn resolve_dir(&self) -> anyhow::Result<PathBuf> {
        let canonical = self.dir.canonicalize().map_err(|e| {
            anyhow::anyhow!("Directory '{}' is not accessible: {}", self.dir.display(), e)
        })?;
        if !canonical.is_dir() {
            anyhow::bail!("'{}' is not a directory", canonical.display());
        }
        Ok(canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_once_with_db() {
        let args = Args::parse_from(["annotation-sync", "notes", "--once", "--db", "x.db"]);
        assert_eq!(args.dir, PathBuf::from("notes"));
        assert!(args.once);
        assert_eq!(args.db, Some(PathBuf::from("x.db")));
    }

    #[test]
    fn test_defaults_to_current_dir() {
        let args = Args::parse_from(["annotation-sync"]);
        assert_eq!(args.dir, PathBuf::from("."));
        assert!(!args.once);
    }

    #[test]
    fn test_resolve_missing_dir_fails() {
        let args = Args::parse_from(["annotation-sync", "/definitely/not/here"]);
        assert!(args.resolve_dir().is_err());
    }
}
