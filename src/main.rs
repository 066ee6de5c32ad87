//! rawimg - read files and metadata from raw disk images
//!
//! Usage:
//!
//!     rawimg [-K <hexkey>] [--sector <n>] [--tweak-offset <n>] <image> <command> [args...]
//!
//! Commands: ls, cat, stat, info, free, fscat, freecat, freefscat, nbd,
//! freenbd. The fscat/freefscat commands open a nested image and recurse,
//! so commands chain: `rawimg disk.img fscat p0/inner.img ls /`.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use time::macros::format_description;

use rawimg::block::{BlockRead, FileBackend, SharedReader, SharedWriter};
use rawimg::extent::{Extent, ExtentReader, ExtentWriter, Range};
use rawimg::fsys::{self, FileInfo, Filesystem};
use rawimg::nbd;
use rawimg::xts::{XtsCipher, XtsReader, XtsWriter};

#[derive(Parser, Debug)]
#[command(name = "rawimg")]
#[command(about = "Read files and metadata from raw disk images", long_about = None)]
struct Args {
    /// XTS-AES key in hex; the image is decrypted transparently
    #[arg(short = 'K', long = "key", value_name = "HEXKEY")]
    key: Option<String>,

    /// XTS sector size in bytes
    #[arg(long, default_value_t = 512, value_name = "N")]
    sector: usize,

    /// Sector-number offset added to every XTS tweak
    #[arg(long = "tweak-offset", default_value_t = 0, value_name = "N")]
    tweak_offset: u64,

    /// Disk image to open
    image: PathBuf,

    /// Command and arguments (ls, cat, stat, info, free, fscat, freecat,
    /// freefscat, nbd, freenbd)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("rawimg: {e:#}");
        process::exit(1);
    }
}

/// A composed view of an image: the reader stack and, when the user asked
/// for a read-write export, its writer twin. Each layer is built in both
/// orientations from the start, so the write path never has to unwrap
/// readers.
struct Layer {
    reader: SharedReader,
    writer: Option<SharedWriter>,
}

#[derive(Debug, Default)]
struct CryptoOpts {
    key: Option<Vec<u8>>,
    sector: usize,
    tweak_offset: u64,
}

fn run(args: Args) -> Result<()> {
    // The nbd command decides whether the image must be writable; scan
    // for it up front so the root file is opened in the right mode.
    let want_rw = args.command.iter().any(|a| a == "-rw");

    let layer = if want_rw {
        let backend = Arc::new(
            FileBackend::open_rw(&args.image)
                .with_context(|| format!("opening {} read-write", args.image.display()))?,
        );
        Layer {
            reader: backend.clone(),
            writer: Some(backend),
        }
    } else {
        let backend = Arc::new(
            FileBackend::open(&args.image)
                .with_context(|| format!("opening {}", args.image.display()))?,
        );
        Layer {
            reader: backend,
            writer: None,
        }
    };

    let crypto = CryptoOpts {
        key: args
            .key
            .as_deref()
            .map(|k| hex::decode(k).context("invalid hex key"))
            .transpose()?,
        sector: args.sector,
        tweak_offset: args.tweak_offset,
    };
    let layer = apply_crypto(layer, &crypto)?;

    run_command(layer, &args.command)
}

fn apply_crypto(layer: Layer, opts: &CryptoOpts) -> Result<Layer> {
    let Some(key) = opts.key.as_ref() else {
        return Ok(layer);
    };

    let cipher = Arc::new(XtsCipher::new(key, opts.sector, opts.tweak_offset)?);
    let size = layer.reader.size();
    Ok(Layer {
        reader: Arc::new(XtsReader::new(layer.reader, cipher.clone(), size)),
        writer: layer
            .writer
            .map(|w| Arc::new(XtsWriter::new(w, cipher, size)) as SharedWriter),
    })
}

fn open_fs(layer: &Layer) -> Result<Box<dyn Filesystem>> {
    Ok(fsys::detect_and_open(layer.reader.clone())?)
}

fn run_command(layer: Layer, args: &[String]) -> Result<()> {
    let (cmd, rest) = args.split_first().context("missing command")?;

    match cmd.as_str() {
        "ls" => cmd_ls(&layer, rest),
        "cat" => cmd_cat(&layer, rest),
        "stat" => cmd_stat(&layer, rest),
        "info" => cmd_info(&layer),
        "free" => cmd_free(&layer),
        "freecat" => cmd_freecat(&layer),
        "fscat" => cmd_fscat(layer, rest),
        "freefscat" => cmd_freefscat(layer, rest),
        "nbd" => cmd_nbd(layer, rest),
        "freenbd" => cmd_freenbd(layer, rest),
        other => bail!(
            "unknown command: {other} (use ls, cat, stat, info, free, fscat, freecat, freefscat, nbd, or freenbd)"
        ),
    }
}

fn cmd_ls(layer: &Layer, args: &[String]) -> Result<()> {
    let mut long = false;
    let mut path = ".";
    for a in args {
        match a.as_str() {
            "-l" => long = true,
            other => path = other,
        }
    }

    let fs = open_fs(layer)?;
    let info = fs.stat(path)?;

    let entries = if info.is_dir {
        fs.read_dir(path)?
    } else {
        vec![info]
    };

    for e in &entries {
        if long {
            println!(
                "{} {:>12} {} {}",
                mode_string(e),
                e.size,
                format_mtime(e),
                e.name
            );
        } else {
            println!("{}", e.name);
        }
    }
    Ok(())
}

fn cmd_cat(layer: &Layer, args: &[String]) -> Result<()> {
    let path = args.first().context("cat requires a path argument")?;
    let fs = open_fs(layer)?;

    let info = fs.stat(path)?;
    if info.is_dir {
        bail!("{path}: is a directory");
    }

    let reader = file_reader(fs.as_ref(), path, info.size)?;
    copy_to_stdout(&reader)
}

fn cmd_stat(layer: &Layer, args: &[String]) -> Result<()> {
    let path = args.first().context("stat requires a path argument")?;
    let fs = open_fs(layer)?;
    let info = fs.stat(path)?;

    println!("Name:  {}", info.name);
    println!("Size:  {}", info.size);
    println!("Mode:  {}", mode_string(&info));
    println!("Mtime: {}", format_mtime(&info));
    if let Some(ino) = info.inode {
        println!("Inode: {ino}");
    }
    Ok(())
}

fn cmd_info(layer: &Layer) -> Result<()> {
    let fs = open_fs(layer)?;
    println!("Filesystem type: {}", fs.type_name());
    if let Some(info) = fs.info() {
        println!();
        println!("{info}");
    }
    Ok(())
}

fn cmd_free(layer: &Layer) -> Result<()> {
    let fs = open_fs(layer)?;
    let ranges = fs.free_ranges()?;

    let total: u64 = ranges.iter().map(|r| r.len()).sum();
    println!(
        "Free ranges ({} ranges, {} total):",
        ranges.len(),
        format_size(total)
    );
    for r in &ranges {
        println!("[{}, {}) {}", r.start, r.end, format_size(r.len()));
    }
    Ok(())
}

fn cmd_freecat(layer: &Layer) -> Result<()> {
    let fs = open_fs(layer)?;
    let (reader, _) = free_reader(fs.as_ref())?;
    copy_to_stdout(&reader)
}

fn cmd_fscat(layer: Layer, args: &[String]) -> Result<()> {
    let (crypto, consumed) = parse_crypto_flags(args)?;
    let rest = &args[consumed..];
    let path = rest
        .first()
        .context("usage: fscat [-K <hexkey>] <path/to/inner.img> <command> [args...]")?;
    let remaining = rest
        .get(1..)
        .filter(|r| !r.is_empty())
        .context("fscat: missing command for inner image")?;

    let inner = descend(&layer, path)?;
    let inner = apply_crypto(inner, &crypto)?;
    run_command(inner, remaining)
}

fn cmd_freefscat(layer: Layer, args: &[String]) -> Result<()> {
    let (crypto, consumed) = parse_crypto_flags(args)?;
    let remaining = &args[consumed..];
    if remaining.is_empty() {
        bail!("usage: freefscat [-K <hexkey>] <command> [args...]");
    }

    let fs = open_fs(&layer)?;
    let (reader, _) = free_reader(fs.as_ref())?;
    let inner = apply_crypto(
        Layer {
            reader,
            writer: None,
        },
        &crypto,
    )?;
    run_command(inner, remaining)
}

#[derive(Debug)]
struct NbdOpts {
    socket: PathBuf,
    name: String,
    rw: bool,
}

fn parse_nbd_flags(args: &[String]) -> Result<(NbdOpts, usize)> {
    let mut opts = NbdOpts {
        socket: PathBuf::from("/tmp/rawimg.sock"),
        name: "export".to_string(),
        rw: false,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-socket" | "--socket" => {
                opts.socket = PathBuf::from(args.get(i + 1).context("-socket needs a value")?);
                i += 2;
            }
            "-name" | "--name" => {
                opts.name = args.get(i + 1).context("-name needs a value")?.clone();
                i += 2;
            }
            "-rw" | "--rw" => {
                opts.rw = true;
                i += 1;
            }
            _ => break,
        }
    }
    Ok((opts, i))
}

fn cmd_nbd(layer: Layer, args: &[String]) -> Result<()> {
    let (opts, consumed) = parse_nbd_flags(args)?;
    let path = args
        .get(consumed)
        .map(String::as_str)
        .unwrap_or(".");

    let (reader, writer) = if path == "." {
        (layer.reader.clone(), layer.writer.clone())
    } else {
        let inner = descend(&layer, path)?;
        (inner.reader, inner.writer)
    };

    let writer = if opts.rw {
        if writer.is_none() {
            bail!("{path}: cannot build a write path for this export");
        }
        writer
    } else {
        None
    };

    let size = reader.size();
    let mut server = nbd::Server::new(&opts.socket);
    server.add_export(nbd::Export {
        name: opts.name,
        size,
        reader,
        writer,
    })?;
    server.serve()?;
    Ok(())
}

fn cmd_freenbd(layer: Layer, args: &[String]) -> Result<()> {
    let (opts, _) = parse_nbd_flags(args)?;
    if opts.rw {
        bail!("freenbd: free-space exports are read-only");
    }

    let fs = open_fs(&layer)?;
    let (reader, _) = free_reader(fs.as_ref())?;

    let size = reader.size();
    let mut server = nbd::Server::new(&opts.socket);
    server.add_export(nbd::Export {
        name: opts.name,
        size,
        reader,
        writer: None,
    })?;
    server.serve()?;
    Ok(())
}

fn parse_crypto_flags(args: &[String]) -> Result<(CryptoOpts, usize)> {
    let mut opts = CryptoOpts {
        key: None,
        sector: 512,
        tweak_offset: 0,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-K" | "--key" => {
                let hexkey = args.get(i + 1).context("-K needs a value")?;
                opts.key = Some(hex::decode(hexkey).context("invalid hex key")?);
                i += 2;
            }
            "-sector" | "--sector" => {
                opts.sector = args
                    .get(i + 1)
                    .context("-sector needs a value")?
                    .parse()
                    .context("invalid sector size")?;
                i += 2;
            }
            "-tweak-offset" | "--tweak-offset" => {
                opts.tweak_offset = args
                    .get(i + 1)
                    .context("-tweak-offset needs a value")?
                    .parse()
                    .context("invalid tweak offset")?;
                i += 2;
            }
            _ => break,
        }
    }
    Ok((opts, i))
}

/// Open the file at `path` as a nested image: extent-composed against the
/// current layer when the filesystem can map it, buffered otherwise. The
/// writer twin exists only for the extent-composed case.
fn descend(layer: &Layer, path: &str) -> Result<Layer> {
    let fs = open_fs(layer)?;
    let info = fs.stat(path)?;
    if info.is_dir && fs.file_extents(path).is_err() {
        bail!("{path}: is a directory, not an image file");
    }

    match (fs.file_extents(path), fs.base_reader()) {
        (Ok(extents), Some(base)) if !extents.is_empty() => {
            let reader = Arc::new(ExtentReader::new(base, extents.clone(), info.size));
            let writer = layer
                .writer
                .as_ref()
                .map(|w| Arc::new(ExtentWriter::new(w.clone(), extents, info.size)) as SharedWriter);
            Ok(Layer {
                reader,
                writer,
            })
        }
        _ => Ok(Layer {
            reader: fs.open(path)?,
            writer: None,
        }),
    }
}

/// A reader over a file's bytes, streaming through its extents when the
/// filesystem can map them.
fn file_reader(fs: &dyn Filesystem, path: &str, size: u64) -> Result<SharedReader> {
    match (fs.file_extents(path), fs.base_reader()) {
        (Ok(extents), Some(base)) if !extents.is_empty() => {
            Ok(Arc::new(ExtentReader::new(base, extents, size)))
        }
        _ => Ok(fs.open(path)?),
    }
}

/// View the filesystem's free space as one concatenated stream.
fn free_reader(fs: &dyn Filesystem) -> Result<(SharedReader, Vec<Range>)> {
    let ranges = fs.free_ranges()?;
    let base = fs
        .base_reader()
        .context("filesystem does not expose its base reader")?;

    let mut extents = Vec::with_capacity(ranges.len());
    let mut logical = 0u64;
    for r in &ranges {
        extents.push(Extent {
            logical,
            physical: r.start,
            length: r.len(),
        });
        logical += r.len();
    }

    Ok((
        Arc::new(ExtentReader::new(base, extents, logical)),
        ranges,
    ))
}

fn copy_to_stdout(reader: &SharedReader) -> Result<()> {
    use std::io::Write;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; 64 * 1024];
    let mut off = 0u64;

    loop {
        let n = reader.read_at(&mut buf, off)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        off += n as u64;
    }
    out.flush()?;
    Ok(())
}

fn mode_string(info: &FileInfo) -> String {
    let mut s = String::with_capacity(10);
    s.push(if info.is_dir { 'd' } else { '-' });
    for shift in [6u32, 3, 0] {
        let bits = (info.mode >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    s
}

fn format_mtime(info: &FileInfo) -> String {
    const FMT: &[time::format_description::FormatItem<'static>] =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    match info.mtime {
        Some(t) => t.format(&FMT).unwrap_or_else(|_| "-".to_string()),
        None => "-".to_string(),
    }
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    match bytes {
        b if b >= TB => format!("{:.1}T", b as f64 / TB as f64),
        b if b >= GB => format!("{:.1}G", b as f64 / GB as f64),
        b if b >= MB => format!("{:.1}M", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1}K", b as f64 / KB as f64),
        b => format!("{b}B"),
    }
}
