use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, String>;

pub fn handle_error_and_exit(err: String) -> ! {
    log::error!("{}", err);
    std::process::exit(1);
}

pub fn results_path(output_dir: &Path, stem: &str) -> PathBuf {
    output_dir.join(format!("{}_results.npy", stem))
}
