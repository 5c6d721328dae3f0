//! Inspect quarry paged files: header fields, free list, bucket chains.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use quarry::hash::PagedHashTable;
use quarry::paged::{PagedFile, PagedFileOptions};
use quarry::{PageBuf, Result, PAGE_SIZE};

#[derive(Parser)]
#[command(name = "quarry-inspect", about = "Inspect quarry paged files")]
struct Args {
    /// Path to the paged file.
    path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the header page (free-list head, highest page, user field).
    Header,
    /// Walk the in-file free list and print each chained page number.
    FreeList,
    /// Interpret the file as a hash table and summarize bucket chains.
    Buckets {
        /// Only print chains with more than this many pages.
        #[arg(long, default_value_t = 0)]
        min_pages: usize,
    },
}

fn open_options() -> PagedFileOptions {
    PagedFileOptions {
        initial_size: 0,
        truncate: false,
        direct_io: false,
        fsync_on_write: false,
        file_id: 1,
    }
}

fn show_header(path: &PathBuf) -> Result<()> {
    let file = PagedFile::open(path, open_options())?;
    println!("file:          {}", path.display());
    println!("page size:     {PAGE_SIZE}");
    println!("free head:     {}", file.free_head());
    println!("highest page:  {}", file.highest_page());
    println!("user field:    {}", file.user_field());
    Ok(())
}

fn show_free_list(path: &PathBuf) -> Result<()> {
    let file = PagedFile::open(path, open_options())?;
    let mut next = file.free_head();
    let mut count = 0u64;
    let mut buf = PageBuf::zeroed();
    while next != 0 {
        println!("{next}");
        file.read_page(next as u32, &mut buf)?;
        next = u64::from_le_bytes(buf[..8].try_into().expect("8-byte slice"));
        count += 1;
        if count > u64::from(file.highest_page()) {
            eprintln!("free list longer than the file; aborting walk");
            break;
        }
    }
    println!("{count} free page(s)");
    Ok(())
}

fn show_buckets(path: &PathBuf, min_pages: usize) -> Result<()> {
    let table = PagedHashTable::open(path, 16, open_options())?;
    let mut total_entries = 0u64;
    let mut total_pages = 0usize;
    for bucket in 0..table.bucket_count() {
        let chain = table.bucket_chain(bucket)?;
        let entries: u64 = chain.iter().map(|page| page.n_entries).sum();
        total_entries += entries;
        total_pages += chain.len();
        if chain.len() > min_pages {
            println!(
                "bucket {bucket}: {} page(s), {} entrie(s)",
                chain.len(),
                entries
            );
        }
    }
    println!(
        "{} bucket(s), {} chained page(s), {} entrie(s) total",
        table.bucket_count(),
        total_pages,
        total_entries
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();
    let result = match args.command {
        Command::Header => show_header(&args.path),
        Command::FreeList => show_free_list(&args.path),
        Command::Buckets { min_pages } => show_buckets(&args.path, min_pages),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
