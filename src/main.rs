use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use au::error::{Error, Result};
use au::grep::{Pattern, StrPattern};
use au::ingest::{self, IngestOptions};
use au::stats::{self, StatsOptions};
use au::Encoder;

#[derive(Parser)]
#[command(name = "au", version, about = "Tooling for the au binary record format")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encode a stream of JSON values into an au stream
    Json2au {
        /// Input path, or - for stdin
        #[arg(default_value = "-")]
        input: String,
        /// Output path, or - for stdout
        #[arg(default_value = "-")]
        output: String,
        /// Stop after this many records
        max_records: Option<u64>,
    },
    /// Report frame and value statistics for au streams
    Stats {
        /// Dump dictionary additions
        #[arg(short, long)]
        dict: bool,
        /// Show the integer varint-size histogram
        #[arg(short, long)]
        ints: bool,
        /// Input paths; stdin when empty
        files: Vec<String>,
    },
    /// Search an au stream for records with a matching value
    Grep(GrepArgs),
}

#[derive(Args)]
#[command(group(clap::ArgGroup::new("value").required(true)))]
struct GrepArgs {
    /// Match values only under this object key
    #[arg(short, long)]
    key: Option<String>,
    /// Match a signed integer value
    #[arg(short = 'i', long, group = "value", allow_hyphen_values = true)]
    int: Option<i64>,
    /// Match an unsigned integer value
    #[arg(short = 'u', long, group = "value")]
    uint: Option<u64>,
    /// Match a double value
    #[arg(short = 'd', long, group = "value", allow_hyphen_values = true)]
    double: Option<f64>,
    /// Match a string value (substring unless --full-match)
    #[arg(short = 's', long, group = "value")]
    string: Option<String>,
    /// Match the whole string value, not a substring
    #[arg(long, requires = "string")]
    full_match: bool,
    /// Stop after this many matches
    #[arg(short = 'm', long = "matches")]
    num_matches: Option<u64>,
    /// Records of context before each match
    #[arg(short = 'B', long, default_value_t = 0)]
    before_context: u32,
    /// Records of context after each match
    #[arg(short = 'A', long, default_value_t = 0)]
    after_context: u32,
    /// Print only the match count
    #[arg(short = 'c', long)]
    count: bool,
    /// Binary-search a stream ordered by the matched key
    #[arg(long)]
    bisect: bool,
    /// Input path
    file: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("au: {e}");
        std::process::exit(match e {
            Error::Parse(_) => 2,
            _ => 1,
        });
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Json2au {
            input,
            output,
            max_records,
        } => json2au(&input, &output, max_records),
        Command::Stats { dict, ints, files } => {
            let options = StatsOptions {
                dict_dump: dict,
                int_histogram: ints,
            };
            let stdout = io::stdout();
            let mut out = stdout.lock();
            if files.is_empty() {
                stats::stats_file("-", options, &mut out)
            } else {
                for file in &files {
                    stats::stats_file(file, options, &mut out)?;
                }
                Ok(())
            }
        }
        Command::Grep(args) => {
            let pattern = build_pattern(&args);
            let stdout = io::stdout();
            let mut out = stdout.lock();
            au::grep::grep_file(&pattern, &args.file, &mut out)?;
            out.flush()?;
            Ok(())
        }
    }
}

fn json2au(input: &str, output: &str, max_records: Option<u64>) -> Result<()> {
    let reader: Box<dyn Read> = if input == "-" {
        Box::new(io::stdin().lock())
    } else {
        Box::new(File::open(input).map_err(|e| Error::Io(format!("open: {e} ({input})")))?)
    };
    let writer: Box<dyn Write> = if output == "-" {
        Box::new(io::stdout().lock())
    } else {
        Box::new(File::create(output).map_err(|e| Error::Io(format!("create: {e} ({output})")))?)
    };

    let mut encoder = Encoder::new(BufWriter::new(writer))?;
    let options = IngestOptions {
        max_records: max_records.unwrap_or(u64::MAX),
        ..IngestOptions::default()
    };
    let stats = ingest::json_to_au(BufReader::new(reader), &mut encoder, &options)?;
    encoder.flush()?;
    tracing::debug!(records = stats.records, bytes = encoder.pos(), "encoded");
    Ok(())
}

/// Numeric queries match both wire encodings of the number: non-negative
/// integers always travel unsigned, so `-i 7` must also match a `U` value.
fn build_pattern(args: &GrepArgs) -> Pattern {
    let mut pattern = Pattern {
        key: args.key.clone(),
        double_value: args.double,
        num_matches: args.num_matches,
        before_context: args.before_context,
        after_context: args.after_context,
        count: args.count,
        bisect: args.bisect,
        ..Pattern::default()
    };
    if let Some(i) = args.int {
        pattern.int_value = Some(i);
        if i >= 0 {
            pattern.uint_value = Some(i as u64);
        }
    }
    if let Some(u) = args.uint {
        pattern.uint_value = Some(u);
        if u <= i64::MAX as u64 {
            pattern.int_value = Some(u as i64);
        }
    }
    if let Some(text) = &args.string {
        pattern.str_value = Some(StrPattern {
            text: text.clone(),
            full_match: args.full_match,
        });
    }
    pattern
}
