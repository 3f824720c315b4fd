use super::{npy, Result};
use flate2::read::MultiGzDecoder;
use ndarray::ArrayD;
use std::fs::File;
use std::io::{BufReader, Read as ioRead};
use std::path::Path;

pub fn open_npy_reader(path: &Path) -> Result<BufReader<Box<dyn ioRead>>> {
    fn is_gzipped(path: &Path) -> bool {
        let path_str = path.to_string_lossy().to_lowercase();
        path_str.ends_with(".gz") || path_str.ends_with(".gzip")
    }
    let file = File::open(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    if is_gzipped(path) {
        let gz_decoder = MultiGzDecoder::new(file);
        if gz_decoder.header().is_some() {
            Ok(BufReader::new(Box::new(gz_decoder)))
        } else {
            Err(format!("Invalid gzip header: {}", path.to_string_lossy()))
        }
    } else {
        Ok(BufReader::new(Box::new(file)))
    }
}

pub fn read_f32_array(path: &Path) -> Result<ArrayD<f32>> {
    let reader = open_npy_reader(path)?;
    npy::read_f32(reader).map_err(|e| format!("{}: {}", path.display(), e))
}

pub fn read_i64_array(path: &Path) -> Result<ArrayD<i64>> {
    let reader = open_npy_reader(path)?;
    npy::read_i64(reader).map_err(|e| format!("{}: {}", path.display(), e))
}
