//! Command-line front end: option parsing, logger setup, program loading,
//! and run-end statistics.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Arg, ArgAction, Command};

use unlam::eval::Machine;
use unlam::gc::{Heap, HeapConfig};
use unlam::reader;

/// Writer that pushes every byte straight through.
struct Unbuffered<W: Write>(W);

impl<W: Write> Write for Unbuffered<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.0.write(buf)?;
        self.0.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

fn main() -> ExitCode {
    let matches = Command::new("unlam")
        .about("Unlambda interpreter with a generational heap")
        .arg(
            Arg::new("program")
                .value_name("FILE")
                .help("Program file; read from standard input when omitted"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("-v run-end stats, -vv major-GC logs, -vvv minor-GC logs"),
        )
        .arg(
            Arg::new("unbuffered")
                .short('u')
                .long("unbuffered")
                .action(ArgAction::SetTrue)
                .help("Write each output byte through immediately"),
        )
        .arg(
            Arg::new("nursery")
                .long("nursery")
                .value_name("CELLS")
                .value_parser(clap::value_parser!(usize))
                .help("Size of each nursery half, in cells"),
        )
        .arg(
            Arg::new("heap-limit")
                .long("heap-limit")
                .value_name("CELLS")
                .value_parser(clap::value_parser!(usize))
                .help("Cap the old generation; exceeding it is a fatal error"),
        )
        .get_matches();

    let verbose = matches.get_count("verbose");
    let level = match verbose {
        0 | 1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    let mut config = HeapConfig::default();
    if let Some(cells) = matches.get_one::<usize>("nursery") {
        config.young_size = *cells;
    }
    if let Some(cells) = matches.get_one::<usize>("heap-limit") {
        config.max_old_cells = *cells;
    }

    let program = matches.get_one::<String>("program").map(String::as_str);
    match run(program, config, matches.get_flag("unbuffered"), verbose) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("unlam: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(
    path: Option<&str>,
    config: HeapConfig,
    unbuffered: bool,
    verbose: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut heap = Heap::new(config);
    let stdin = io::stdin();
    let mut stdin = stdin.lock();

    let program = match path {
        Some(name) => {
            let file = File::open(name).map_err(|e| format!("cannot open {}: {}", name, e))?;
            reader::parse(&mut heap, &mut BufReader::new(file))?
        }
        None => {
            let root = reader::parse(&mut heap, &mut stdin)?;
            // Drop the rest of the program's final line so `@` and `?` see
            // only the intended input stream.
            consume_line(&mut stdin);
            root
        }
    };

    let stdout = io::stdout();
    let output: Box<dyn Write> = if unbuffered {
        Box::new(Unbuffered(stdout.lock()))
    } else {
        Box::new(BufWriter::new(stdout.lock()))
    };

    let start = Instant::now();
    Machine::new(stdin, output).run(&mut heap, program)?;
    let elapsed = start.elapsed();

    if verbose >= 1 {
        let stats = &heap.stats;
        let gc_secs = stats.gc_time.as_secs_f64();
        eprintln!(
            "  total eval time --- {:5.2} sec.",
            (elapsed.as_secs_f64() - gc_secs).max(0.0)
        );
        eprintln!("  total gc time   --- {:5.2} sec.", gc_secs);
        eprintln!(
            "  minor / major collections - {} / {}",
            stats.minor_collections, stats.major_collections
        );
        eprintln!(
            "  cells copied / promoted   - {} / {}",
            stats.cells_copied, stats.cells_promoted
        );
        eprintln!(
            "  old generation            - {} live of {} cells in {} chunks",
            stats.old_cells_live,
            heap.old_capacity(),
            stats.heap_chunks
        );
    }
    Ok(())
}

/// Read and discard up to and including the next newline.
fn consume_line<R: Read>(input: &mut R) {
    let mut buf = [0u8; 1];
    loop {
        match input.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf[0] == b'\n' {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}
