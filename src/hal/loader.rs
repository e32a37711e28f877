use ndarray::Array2;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Parses a recording file into a `[n_samples, n_channels]` array
pub trait DataLoader: Send + Sync {
    fn load(&self, path: &Path, kwargs: &Map<String, Value>) -> Result<Array2<f64>>;
}

/// Delimited text loader.
///
/// Recognized kwargs: `delimiter` (default: any whitespace), `skiprows`
/// (leading lines to drop), `comments` (line prefix to ignore, default `#`)
/// and `usecols` (column indices to keep).
#[derive(Debug, Clone, Copy, Default)]
pub struct TextLoader;

struct TextOptions {
    delimiter: Option<String>,
    skiprows: usize,
    comments: String,
    usecols: Option<Vec<usize>>,
}

impl TextOptions {
    fn from_kwargs(kwargs: &Map<String, Value>) -> Result<Self> {
        let delimiter = match kwargs.get("delimiter") {
            None | Some(Value::Null) => None,
            Some(Value::String(d)) => Some(d.clone()),
            Some(other) => return Err(Error::InvalidConfig(format!("delimiter must be a string, got {}", other))),
        };
        let skiprows = match kwargs.get("skiprows") {
            None => 0,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| Error::InvalidConfig(format!("skiprows must be a count, got {}", value)))?
                as usize,
        };
        let comments = match kwargs.get("comments") {
            None => "#".to_string(),
            Some(Value::String(c)) => c.clone(),
            Some(other) => return Err(Error::InvalidConfig(format!("comments must be a string, got {}", other))),
        };
        let usecols = match kwargs.get("usecols") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|item| {
                        item.as_u64()
                            .map(|i| i as usize)
                            .ok_or_else(|| Error::InvalidConfig(format!("usecols entries must be indices, got {}", item)))
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            Some(other) => return Err(Error::InvalidConfig(format!("usecols must be a list, got {}", other))),
        };
        Ok(Self {
            delimiter,
            skiprows,
            comments,
            usecols,
        })
    }

    fn split<'a>(&self, line: &'a str) -> Vec<&'a str> {
        match &self.delimiter {
            Some(delimiter) => line.split(delimiter.as_str()).map(str::trim).collect(),
            None => line.split_whitespace().collect(),
        }
    }
}

impl TextLoader {
    pub fn parse(&self, text: &str, kwargs: &Map<String, Value>) -> Result<Array2<f64>> {
        let options = TextOptions::from_kwargs(kwargs)?;
        let mut rows: Vec<Vec<f64>> = Vec::new();

        for (lineno, line) in text.lines().enumerate().skip(options.skiprows) {
            let line = line.trim();
            if line.is_empty() || (!options.comments.is_empty() && line.starts_with(&options.comments)) {
                continue;
            }
            let fields = options.split(line);
            let selected: Vec<&str> = match &options.usecols {
                Some(cols) => cols
                    .iter()
                    .map(|&i| {
                        fields.get(i).copied().ok_or_else(|| {
                            Error::Parse(format!("line {}: no column {}", lineno + 1, i))
                        })
                    })
                    .collect::<Result<_>>()?,
                None => fields,
            };
            let row = selected
                .iter()
                .map(|field| {
                    field
                        .parse::<f64>()
                        .map_err(|_| Error::Parse(format!("line {}: `{}` is not a number", lineno + 1, field)))
                })
                .collect::<Result<Vec<_>>>()?;

            if let Some(first) = rows.first() {
                if first.len() != row.len() {
                    return Err(Error::Shape(format!(
                        "line {} has {} columns, expected {}",
                        lineno + 1,
                        row.len(),
                        first.len()
                    )));
                }
            }
            rows.push(row);
        }

        let n_cols = rows.first().map(Vec::len).unwrap_or(0);
        let n_rows = rows.len();
        Ok(Array2::from_shape_vec((n_rows, n_cols), rows.into_iter().flatten().collect())?)
    }
}

impl DataLoader for TextLoader {
    fn load(&self, path: &Path, kwargs: &Map<String, Value>) -> Result<Array2<f64>> {
        let text = fs::read_to_string(path)?;
        self.parse(&text, kwargs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use serde_json::json;

    fn kwargs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_whitespace_with_comments() {
        let text = "# header\n1 2 3\n4 5 6\n";
        let data = TextLoader.parse(text, &Map::new()).unwrap();
        assert_eq!(data, array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
    }

    #[test]
    fn test_delimiter_skiprows_usecols() {
        let text = "a,b,c\n1,2,3\n4,5,6\n";
        let data = TextLoader
            .parse(text, &kwargs(json!({"delimiter": ",", "skiprows": 1, "usecols": [0, 2]})))
            .unwrap();
        assert_eq!(data, array![[1.0, 3.0], [4.0, 6.0]]);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        assert!(matches!(TextLoader.parse("1 2\n3\n", &Map::new()), Err(Error::Shape(_))));
        assert!(matches!(TextLoader.parse("1 x\n", &Map::new()), Err(Error::Parse(_))));
    }
}
