use std::{
    fs::OpenOptions,
    io::{BufRead, BufReader},
    path::Path,
};

use crate::model;

/// Reads one symbol per line. Blank lines and `#` comments are skipped.
pub fn read_symbols_from_file(symbols_file_path: &str) -> model::Result<Vec<String>> {
    let path = Path::new(symbols_file_path);
    if !path.exists() {
        return Err(model::QuotesError::FileNotFound(symbols_file_path.into()));
    }

    let file = OpenOptions::new().read(true).open(path)?;

    let mut symbols = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let symbol = line.trim();
        if symbol.is_empty() || symbol.starts_with('#') {
            continue;
        }
        symbols.push(symbol.to_uppercase());
    }

    if symbols.is_empty() {
        return Err(model::QuotesError::EmptySymbolFile(symbols_file_path.into()));
    }
    Ok(symbols)
}
