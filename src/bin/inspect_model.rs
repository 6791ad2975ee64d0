//! モデルファイルのメタデータを表示

use std::path::PathBuf;
use std::process::ExitCode;

use safety_detector::model::{load_metadata, print_metadata_info, ServingSettings};

fn main() -> ExitCode {
    let model_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| ServingSettings::default().model_path);

    match load_metadata(&model_path) {
        Ok(metadata) => {
            println!("Model: {}\n", model_path.display());
            print_metadata_info(&metadata);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
