//! モデルファイル（.tar.gz）のメタデータを表示する簡易バイナリ

use digit_lab_lib::model::{load_metadata, print_metadata_info};
use std::path::PathBuf;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: inspect_artifact <model_path> [model_path...]");
        std::process::exit(2);
    }

    let mut failed = false;
    for arg in &args[1..] {
        let model_path = PathBuf::from(arg);
        println!("{}", model_path.display());
        match load_metadata(&model_path) {
            Ok(metadata) => print_metadata_info(&metadata),
            Err(e) => {
                eprintln!("✗ エラー: {}", e);
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
}
