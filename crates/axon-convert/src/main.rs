use std::path::PathBuf;

use axon_convert::{Converter, InputFormat, Options, OutputFormat, run};
use clap::Parser;

/// Converts serialized data from one format to another.
///
/// When no input file is given, data is read from stdin.
#[derive(Parser, Debug)]
#[command(
    name = "siconvert",
    group(clap::ArgGroup::new("input").required(true)),
    group(clap::ArgGroup::new("output").required(true))
)]
struct Args {
    /// Read binary data
    #[arg(short = 'b', group = "input")]
    input_bin: bool,
    /// Read xml data
    #[arg(short = 'x', group = "input")]
    input_xml: bool,
    /// Read json data
    #[arg(short = 'j', group = "input")]
    input_json: bool,
    /// Read csv data
    #[arg(short = 'c', group = "input")]
    input_csv: bool,
    /// Read http query string
    #[arg(short = 'q', group = "input")]
    input_qparams: bool,

    /// Output binary data
    #[arg(short = 'B', group = "output")]
    output_bin: bool,
    /// Output xml data
    #[arg(short = 'X', group = "output")]
    output_xml: bool,
    /// Output xml data without attributes
    #[arg(short = 'Y', group = "output")]
    output_xml_plain: bool,
    /// Output json data
    #[arg(short = 'J', group = "output")]
    output_json: bool,
    /// Output csv data
    #[arg(short = 'C', group = "output")]
    output_csv: bool,
    /// Output properties data
    #[arg(short = 'P', group = "output")]
    output_properties: bool,
    /// Output number of objects
    #[arg(short = 'N', group = "output")]
    output_count: bool,

    /// Beautify output (xml, json)
    #[arg(short = 'd')]
    beautify: bool,
    /// Skip <N> objects
    #[arg(long, default_value_t = 0)]
    skip: u64,
    /// Read <N> objects (default unlimited)
    #[arg(long)]
    num: Option<u64>,
    /// Output filename (stdout when omitted)
    #[arg(short = 'o')]
    output: Option<PathBuf>,
    /// Print each processed filename to stderr
    #[arg(short = 'v')]
    verbose: bool,

    /// Input files
    files: Vec<PathBuf>,
}

impl Args {
    fn input_format(&self) -> InputFormat {
        if self.input_bin {
            InputFormat::Binary
        } else if self.input_xml {
            InputFormat::Xml
        } else if self.input_json {
            InputFormat::Json
        } else if self.input_csv {
            InputFormat::Csv
        } else {
            InputFormat::QueryString
        }
    }

    fn output_format(&self) -> OutputFormat {
        if self.output_bin {
            OutputFormat::Binary
        } else if self.output_xml {
            OutputFormat::Xml
        } else if self.output_xml_plain {
            OutputFormat::XmlPlain
        } else if self.output_json {
            OutputFormat::Json
        } else if self.output_csv {
            OutputFormat::Csv
        } else if self.output_properties {
            OutputFormat::Properties
        } else {
            OutputFormat::Count
        }
    }
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();

    let options = Options {
        input: args.input_format(),
        output: args.output_format(),
        beautify: args.beautify,
        skip: args.skip,
        num: args.num,
    };
    let mut converter = Converter::new(options);

    let result = match &args.output {
        Some(path) => match std::fs::File::create(path) {
            Ok(mut file) => run(&mut converter, &args.files, &mut file, args.verbose),
            Err(e) => {
                eprintln!("cannot create {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => run(&mut converter, &args.files, &mut std::io::stdout().lock(), args.verbose),
    };

    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
