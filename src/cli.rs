use crate::mimsi::bags::{DEFAULT_COVERAGE, DEFAULT_REPEAT_COUNT};
use crate::utils::Result;
use chrono::Datelike;
use clap::{ArgAction, Args, Parser};
use env_logger::fmt::Color;
use log::{Level, LevelFilter};
use once_cell::sync::Lazy;
use std::{
    io::Write,
    path::{Path, PathBuf},
};

pub static FULL_VERSION: Lazy<String> = Lazy::new(|| {
    format!(
        "{}-{}",
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_GIT_DESCRIBE")
    )
});

#[derive(Parser)]
#[command(name="mimsi",
          version=&**FULL_VERSION,
          about="MiMSI Sample(s) Evaluation Utility",
          long_about = None,
          after_help = format!("Copyright (C) 2018-{}     Memorial Sloan Kettering Cancer Center.
This program is free software distributed under the GNU General Public
License, version 3 or later. It comes with ABSOLUTELY NO WARRANTY.", chrono::Utc::now().year()),
          help_template = "{name} {version}\n{about-section}\n{usage-heading}\n    {usage}\n\n{all-args}{after-help}",
          )]
pub struct Cli {
    #[command(flatten)]
    pub args: EvaluateArgs,

    #[clap(short = 'v')]
    #[clap(long = "verbose")]
    #[clap(action = ArgAction::Count, help = "Specify multiple times to increase verbosity level (e.g., -vv for more verbosity)")]
    pub verbosity: u8,
}

#[derive(Args, Debug)]
pub struct EvaluateArgs {
    #[clap(long = "saved-model")]
    #[clap(help = "Saved model weights to load")]
    #[clap(value_name = "MODEL")]
    #[clap(default_value = "mimsi_mskcc_impact.model")]
    pub saved_model: PathBuf,

    #[clap(long = "vector-location")]
    #[clap(help = "Directory with the generated vectors to evaluate")]
    #[clap(value_name = "DIR")]
    #[clap(default_value = "./eval")]
    pub vector_location: PathBuf,

    #[clap(long = "no-cuda")]
    #[clap(
        help = "Disable accelerated execution; otherwise it is used whenever more than one thread is available"
    )]
    pub no_cuda: bool,

    #[clap(long = "save")]
    #[clap(help = "Save the results of the evaluation to a numpy array")]
    pub save: bool,

    #[clap(long = "name")]
    #[clap(help = "Name of the run, used as the file name of saved multi-sample results")]
    #[clap(value_name = "NAME")]
    #[clap(default_value = "test_run_001")]
    #[arg(value_parser = check_run_name)]
    pub name: String,

    #[clap(long = "seed")]
    #[clap(help = "Random seed")]
    #[clap(value_name = "S")]
    #[clap(default_value = "2")]
    pub seed: u64,

    #[clap(long = "coverage")]
    #[clap(
        help = "Required coverage for both the tumor and the normal. Any coverage in excess of this limit will be randomly downsampled"
    )]
    #[clap(value_name = "COVERAGE")]
    #[clap(default_value_t = DEFAULT_COVERAGE)]
    #[arg(value_parser = at_least_one)]
    pub coverage: usize,

    #[clap(help_heading("Advanced"))]
    #[clap(long = "repeats")]
    #[clap(help = "Number of resampled bags evaluated per sample")]
    #[clap(value_name = "REPEATS")]
    #[clap(default_value_t = DEFAULT_REPEAT_COUNT)]
    #[arg(value_parser = at_least_one)]
    pub repeats: usize,

    #[clap(help_heading("Advanced"))]
    #[clap(long = "output-dir")]
    #[clap(help = "Directory for saved results")]
    #[clap(value_name = "DIR")]
    #[clap(default_value = ".")]
    #[arg(value_parser = check_dir_exists)]
    pub output_dir: PathBuf,

    #[clap(help_heading("Advanced"))]
    #[clap(short = 't')]
    #[clap(long = "threads")]
    #[clap(help = "Number of threads used by accelerated execution")]
    #[clap(value_name = "THREADS")]
    #[clap(default_value = "1")]
    #[arg(value_parser = threads_in_range)]
    pub num_threads: usize,
}

pub fn init_verbose(args: &Cli) {
    let filter_level: LevelFilter = match args.verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };

    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            let level = record.level();
            let mut style = buf.style();
            match record.level() {
                Level::Error => style.set_color(Color::Red),
                Level::Warn => style.set_color(Color::Yellow),
                Level::Info => style.set_color(Color::Green),
                Level::Debug => style.set_color(Color::Blue),
                Level::Trace => style.set_color(Color::Cyan),
            };

            writeln!(
                buf,
                "{} [{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                style.value(level),
                record.args()
            )
        })
        .filter_level(filter_level)
        .init();
}

fn check_dir_exists(s: &str) -> Result<PathBuf> {
    let path = Path::new(s);
    if !path.is_dir() {
        Err(format!("Directory does not exist: {}", path.display()))
    } else {
        Ok(path.to_path_buf())
    }
}

fn check_run_name(s: &str) -> Result<String> {
    if s.trim().is_empty() {
        Err("Run name cannot be an empty string".to_string())
    } else if s.contains(std::path::is_separator) {
        Err(format!("Run name cannot contain a path separator: {}", s))
    } else {
        Ok(s.to_string())
    }
}

fn at_least_one(s: &str) -> Result<usize> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("`{}` is not a valid positive integer", s))?;
    if value >= 1 {
        Ok(value)
    } else {
        Err("Value must be at least 1".into())
    }
}

fn threads_in_range(s: &str) -> Result<usize> {
    let thread: usize = s
        .parse()
        .map_err(|_| format!("`{}` is not a valid thread number", s))?;
    if thread >= 1 {
        Ok(thread)
    } else {
        Err("Number of threads must be at least 1".into())
    }
}
