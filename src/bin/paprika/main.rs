//! paprika — админ-CLI: инициализация арены и офлайн-инспекция.
//!
//! Запуск:
//!   paprika init --path state.pk --size-mb 256 --history 2
//!   paprika status --path state.pk [--json]
//!   paprika root --path state.pk
//!   paprika stats --path state.pk [--json]

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use paprika::{PagedDb, PaprikaConfig};

#[derive(Parser)]
#[command(name = "paprika", version, about = "Paged CoW store for the Ethereum state trie")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Создать новую арену
    Init {
        #[arg(long)]
        path: PathBuf,
        /// Размер арены в мегабайтах
        #[arg(long, default_value_t = 256)]
        size_mb: u64,
        /// Глубина истории корней (2..=32)
        #[arg(long, default_value_t = 2)]
        history: u32,
    },
    /// Краткий статус: батч, блок, корень, заполненность
    Status {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Напечатать текущий корень состояния
    Root {
        #[arg(long)]
        path: PathBuf,
    },
    /// Обход графа страниц и счётчики по типам
    Stats {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn open(path: &PathBuf) -> Result<PagedDb> {
    PagedDb::open(path, PaprikaConfig::from_env())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Init { path, size_mb, history } => {
            let cfg = PaprikaConfig::from_env()
                .with_arena_bytes(size_mb * 1024 * 1024)
                .with_history_depth(history);
            let db = PagedDb::open(&path, cfg)?;
            println!(
                "initialized {} (history depth {}, state root {:x})",
                path.display(),
                db.history_depth(),
                db.state_root()?
            );
        }
        Cmd::Status { path, json } => {
            let db = open(&path)?;
            let stats = db.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("batch        {}", stats.batch_id);
                println!("block        {}", stats.block_number);
                println!("state root   {}", hex::encode(db.state_root()?.as_bytes()));
                println!("history      {}", stats.history_depth);
                println!(
                    "pages        {}/{} ({:.1}% used)",
                    stats.next_free_page,
                    stats.max_page,
                    stats.used_ratio() * 100.0
                );
            }
        }
        Cmd::Root { path } => {
            let db = open(&path)?;
            println!("{}", hex::encode(db.state_root()?.as_bytes()));
        }
        Cmd::Stats { path, json } => {
            let db = open(&path)?;
            let stats = db.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("reachable    {}", stats.reachable_pages);
                println!("data         {}", stats.data_pages);
                println!("bottom       {}", stats.bottom_pages);
                println!("state root   {}", stats.state_root_pages);
                println!("fan-out      {}", stats.fan_out_pages);
                println!("leaf         {}", stats.leaf_pages);
                println!("abandoned    {}", stats.abandoned_pages);
            }
        }
    }
    Ok(())
}
