use crate::dataset::{DataSet, Row, Value};
use anyhow::{Context, Result};
use csv::{ReaderBuilder, Trim, WriterBuilder};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

fn parse_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    match cell.parse::<f64>() {
        Ok(number) if number.is_finite() => Value::Number(number),
        _ => Value::Text(cell.to_string()),
    }
}

/// Read a headed CSV into a data set. Numeric cells become numbers, empty cells null.
pub fn parse_dataset_csv<R: Read>(reader: R) -> Result<DataSet> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(reader);
    let fields: Vec<String> = reader
        .headers()
        .context("reading header")?
        .iter()
        .map(str::to_string)
        .collect();
    let mut rows: Vec<Row> = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading record {}", idx + 1))?;
        rows.push(record.iter().map(parse_cell).collect());
    }
    Ok(DataSet::new(fields, rows)?)
}

pub fn read_dataset_csv(path: &Path) -> Result<DataSet> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    parse_dataset_csv(file).with_context(|| format!("parsing {}", path.display()))
}

pub fn write_dataset_csv<W: Write>(data: &DataSet, writer: W) -> Result<()> {
    let mut writer = WriterBuilder::new().from_writer(writer);
    writer.write_record(data.fields())?;
    for row in data.rows() {
        writer.write_record(row.iter().map(|value| match value {
            Value::Null => String::new(),
            other => other.to_string(),
        }))?;
    }
    writer.flush()?;
    Ok(())
}
