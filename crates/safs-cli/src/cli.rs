use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use safs_storage::{FileDevice, FileManager, ImportPolicy, Safs, SafsConfig, SafsStats};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "safs")]
#[command(about = "Set-associative file storage CLI", long_about = None)]
pub struct Cli {
    /// Configuration file (`key=value` lines)
    #[arg(short, long, env = "SAFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides `root_conf` from the configuration file
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Import an external file as a logical file
    Load {
        source: PathBuf,
        name: String,
        /// `reject` or `idempotent`; defaults to the configured policy
        #[arg(short, long)]
        policy: Option<ImportPolicy>,
    },
    /// List registered logical files
    List,
    /// Write a byte range of a logical file to stdout
    Cat {
        name: String,
        #[arg(short, long, default_value = "0")]
        offset: u64,
        /// Bytes to print; defaults to the rest of the file
        #[arg(short, long)]
        len: Option<u64>,
    },
    /// Print the effective configuration and statistics as JSON
    Stat,
    /// Unregister a logical file and delete its data
    Remove { name: String },
}

#[derive(Serialize)]
struct StatReport<'a> {
    config: &'a SafsConfig,
    files: Vec<FileStat>,
    stats: SafsStats,
}

#[derive(Serialize)]
struct FileStat {
    name: String,
    size: u64,
    checksum: Option<String>,
}

impl Cli {
    /// Reads the configuration file (or defaults) and applies overrides.
    pub fn load_config(&self) -> Result<SafsConfig> {
        let mut config = match &self.config {
            Some(path) => SafsConfig::from_file(path)
                .with_context(|| format!("loading configuration {}", path.display()))?,
            None => {
                tracing::warn!("No configuration file given, using defaults");
                SafsConfig::default()
            }
        };
        if let Some(root) = &self.root {
            config.root_conf = root.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Opens the data root, runs the command and shuts down cleanly.
    pub async fn run(self, config: SafsConfig) -> Result<()> {
        let safs = Safs::from_config(config).context("opening data root")?;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let result = self.execute(&safs, &mut out).await;
        let shutdown = safs.shutdown().await;
        result?;
        shutdown?;
        Ok(())
    }

    pub async fn execute<W: Write>(&self, safs: &Safs<FileDevice>, out: &mut W) -> Result<()> {
        match &self.command {
            Command::Load {
                source,
                name,
                policy,
            } => self.load(safs, source, name, *policy, out).await,
            Command::List => self.list(safs, out),
            Command::Cat { name, offset, len } => self.cat(safs, name, *offset, *len, out).await,
            Command::Stat => self.stat(safs, out),
            Command::Remove { name } => {
                safs.remove(name).await?;
                writeln!(out, "Removed {}", name)?;
                Ok(())
            }
        }
    }

    async fn load<W: Write>(
        &self,
        safs: &Safs<FileDevice>,
        source: &Path,
        name: &str,
        policy: Option<ImportPolicy>,
        out: &mut W,
    ) -> Result<()> {
        let mut manager = FileManager::new(safs.clone());
        if let Some(policy) = policy {
            manager = manager.with_policy(policy);
        }
        let report = manager
            .load(source, name)
            .await
            .with_context(|| format!("importing {} as {}", source.display(), name))?;
        if report.already_present {
            writeln!(out, "{} already loaded ({} bytes)", report.name, report.size)?;
        } else {
            writeln!(
                out,
                "Loaded {} ({}, crc32 {:08x})",
                report.name,
                Self::format_bytes(report.size),
                report.checksum
            )?;
        }
        Ok(())
    }

    fn list<W: Write>(&self, safs: &Safs<FileDevice>, out: &mut W) -> Result<()> {
        writeln!(out, "{:<32} {:>12} {:>10}", "NAME", "SIZE", "CRC32")?;
        writeln!(out, "{}", "-".repeat(56))?;
        for name in safs.list() {
            let Some(entry) = safs.catalog().get(&name) else {
                continue;
            };
            let checksum = entry
                .checksum
                .map(|c| format!("{:08x}", c))
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                out,
                "{:<32} {:>12} {:>10}",
                entry.name,
                Self::format_bytes(entry.size),
                checksum
            )?;
        }
        Ok(())
    }

    async fn cat<W: Write>(
        &self,
        safs: &Safs<FileDevice>,
        name: &str,
        offset: u64,
        len: Option<u64>,
        out: &mut W,
    ) -> Result<()> {
        let file = safs.open(name).await?;
        let len = match len {
            Some(len) => len,
            None => file.size().saturating_sub(offset),
        };
        let len = usize::try_from(len).context("length does not fit in memory")?;
        let bytes = file.read(offset, len).await?;
        file.close().await?;
        out.write_all(&bytes)?;
        out.flush()?;
        Ok(())
    }

    fn stat<W: Write>(&self, safs: &Safs<FileDevice>, out: &mut W) -> Result<()> {
        let files = safs
            .list()
            .into_iter()
            .filter_map(|name| safs.catalog().get(&name))
            .map(|entry| FileStat {
                name: entry.name,
                size: entry.size,
                checksum: entry.checksum.map(|c| format!("{:08x}", c)),
            })
            .collect();
        let report = StatReport {
            config: safs.config(),
            files,
            stats: safs.stats(),
        };
        serde_json::to_writer_pretty(&mut *out, &report)?;
        writeln!(out)?;
        Ok(())
    }

    fn format_bytes(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2} GiB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MiB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KiB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn data_root() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir(&root).unwrap();
        let conf = dir.path().join("safs.conf");
        std::fs::write(
            &conf,
            format!(
                "root_conf={}\ncache_size=256K\nnum_nodes=1\nthreads=2\nmerge_reqs\n",
                root.display()
            ),
        )
        .unwrap();
        (dir, conf)
    }

    async fn run_captured(args: &[&str]) -> (Result<()>, String) {
        let cli = Cli::parse_from(args);
        let config = cli.load_config().unwrap();
        let safs = Safs::from_config(config).unwrap();
        let mut out = Vec::new();
        let result = cli.execute(&safs, &mut out).await;
        safs.shutdown().await.unwrap();
        (result, String::from_utf8_lossy(&out).into_owned())
    }

    #[test]
    fn test_cli_load_subcommand() {
        let cli = Cli::parse_from(["safs", "load", "/tmp/g.adj", "graph"]);
        match &cli.command {
            Command::Load {
                source,
                name,
                policy,
            } => {
                assert_eq!(source, &PathBuf::from("/tmp/g.adj"));
                assert_eq!(name, "graph");
                assert!(policy.is_none());
            }
            _ => panic!("Expected Load command"),
        }
    }

    #[test]
    fn test_cli_load_policy_flag() {
        let cli = Cli::parse_from(["safs", "load", "--policy", "reject", "a", "b"]);
        match &cli.command {
            Command::Load { policy, .. } => assert_eq!(*policy, Some(ImportPolicy::Reject)),
            _ => panic!("Expected Load command"),
        }
        assert!(Cli::try_parse_from(["safs", "load", "--policy", "overwrite", "a", "b"]).is_err());
    }

    #[test]
    fn test_cli_cat_subcommand() {
        let cli = Cli::parse_from(["safs", "cat", "graph", "--offset", "4096", "--len", "16"]);
        match &cli.command {
            Command::Cat { name, offset, len } => {
                assert_eq!(name, "graph");
                assert_eq!(*offset, 4096);
                assert_eq!(*len, Some(16));
            }
            _ => panic!("Expected Cat command"),
        }
    }

    #[test]
    fn test_cli_config_flag() {
        let cli = Cli::parse_from(["safs", "--config", "/etc/safs.conf", "list"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/safs.conf")));
        assert!(matches!(cli.command, Command::List));
    }

    #[test]
    fn test_root_override() {
        let (_dir, conf) = data_root();
        let conf = conf.to_string_lossy().into_owned();
        let cli = Cli::parse_from(["safs", "--config", conf.as_str(), "--root", "/srv/other", "stat"]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.root_conf, PathBuf::from("/srv/other"));
        assert_eq!(config.cache_size, 256 * 1024);
        assert!(config.merge_reqs);
        assert!(!config.print_io_stat);
    }

    #[test]
    fn test_missing_config_file() {
        let cli = Cli::parse_from(["safs", "--config", "/nonexistent/safs.conf", "list"]);
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(Cli::format_bytes(512), "512 B");
        assert_eq!(Cli::format_bytes(2048), "2.00 KiB");
        assert_eq!(Cli::format_bytes(3 * 1024 * 1024), "3.00 MiB");
    }

    #[tokio::test]
    async fn test_load_list_cat_stat() {
        let (dir, conf) = data_root();
        let conf = conf.to_string_lossy().into_owned();
        let source = dir.path().join("edges.bin");
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 200) as u8).collect();
        std::fs::write(&source, &payload).unwrap();
        let source = source.to_string_lossy().into_owned();

        let (result, out) = run_captured(&["safs", "-c", conf.as_str(), "load", source.as_str(), "edges"]).await;
        result.unwrap();
        assert!(out.starts_with("Loaded edges"), "{out}");
        let crc = out.trim_end().trim_end_matches(')').rsplit(' ').next().unwrap().to_string();
        assert_eq!(crc.len(), 8);

        let (result, out) = run_captured(&["safs", "-c", conf.as_str(), "load", source.as_str(), "edges"]).await;
        result.unwrap();
        assert!(out.contains("already loaded"), "{out}");

        let (result, out) = run_captured(&["safs", "-c", conf.as_str(), "list"]).await;
        result.unwrap();
        assert_eq!(out.lines().filter(|l| l.starts_with("edges ")).count(), 1);
        assert!(out.contains(&crc), "{out}");

        let (result, out) =
            run_captured(&["safs", "-c", conf.as_str(), "cat", "edges", "--offset", "5000", "--len", "10"]).await;
        result.unwrap();
        assert_eq!(out.as_bytes(), &payload[5000..5010]);

        let (result, out) = run_captured(&["safs", "-c", conf.as_str(), "stat"]).await;
        result.unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["stats"]["files"], 1);
        assert_eq!(json["files"][0]["name"], "edges");
        assert_eq!(json["files"][0]["size"], payload.len() as u64);
        assert_eq!(json["config"]["num_nodes"], 1);
    }

    #[tokio::test]
    async fn test_cat_missing_file_fails() {
        let (_dir, conf) = data_root();
        let conf = conf.to_string_lossy().into_owned();
        let (result, out) = run_captured(&["safs", "-c", conf.as_str(), "cat", "nope"]).await;
        assert!(result.is_err());
        assert!(out.is_empty());
    }
}
