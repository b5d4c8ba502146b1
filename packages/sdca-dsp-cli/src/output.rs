use std::fs::File;
use std::io::{self, BufWriter, Write};

use serde::Serialize;

use crate::exit_codes;

/// Write `report` as JSON followed by a newline.
fn write_report<T: Serialize, W: Write>(writer: &mut W, report: &T, compact: bool) -> io::Result<()> {
    if compact {
        serde_json::to_writer(&mut *writer, report)?;
    } else {
        serde_json::to_writer_pretty(&mut *writer, report)?;
    }
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Write a report to `output_path` or stdout, returning the process exit code.
pub fn emit<T: Serialize>(report: &T, compact: bool, output_path: Option<&str>) -> i32 {
    let result = match output_path {
        Some(path) => File::create(path)
            .and_then(|file| write_report(&mut BufWriter::new(file), report, compact))
            .map_err(|e| format!("cannot write report to '{}': {}", path, e)),
        None => write_report(&mut io::stdout().lock(), report, compact)
            .map_err(|e| format!("cannot write report to stdout: {}", e)),
    };

    match result {
        Ok(()) => {
            if let Some(path) = output_path {
                log::info!("Report written to {}", path);
            }
            exit_codes::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}", e);
            exit_codes::EXECUTION_ERROR
        }
    }
}
