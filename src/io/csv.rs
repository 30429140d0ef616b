/*!
# Chain and covariance persistence in CSV. Enable via the `csv` feature.

Chains are written one row per stored sample:

```text
entry,step,weight,nll,<param_0>,...,<param_n>,derived:<q_0>,...
```

`entry` is the running index of the sample within the written (post-burn-in) range and
`weight` its multiplicity. Derived-quantity columns carry a `derived:` prefix so that
[`load_chain_csv`] can tell them apart from parameters.

Covariance matrices are written as a square table with a leading `name` column.
Floats use Rust's shortest round-trip formatting, so values read back bit-identical.
*/

use std::fs::File;
use std::io;
use std::path::Path;

use csv::{Reader, Writer};
use nalgebra::DMatrix;

use crate::chain::{Chain, Sample};
use crate::covariance::CovarianceMatrix;
use crate::error::{McmcError, Result};
use crate::summary::DerivedSeries;

const DERIVED_PREFIX: &str = "derived:";
const FIXED_COLUMNS: [&str; 4] = ["entry", "step", "weight", "nll"];

fn invalid(msg: String) -> McmcError {
    McmcError::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}

fn parse<T: std::str::FromStr>(field: &str, column: &str, row: usize) -> Result<T> {
    field
        .trim()
        .parse()
        .map_err(|_| invalid(format!("row {row}: cannot parse '{field}' in column '{column}'")))
}

/**
Saves samples `[burn_in, len)` of `chain` as CSV.

# Arguments

* `chain` - The chain to save.
* `burn_in` - Samples to skip at the start of the chain.
* `derived` - Derived series computed over the same samples (see
  [`crate::summary::evaluate_derived`]); may be empty.
* `filename` - The file path where the CSV data will be written.

# Errors

Any I/O or CSV error, or a derived series whose length differs from the number of
written samples.
*/
pub fn save_chain_csv(
    chain: &Chain,
    burn_in: usize,
    derived: &[DerivedSeries],
    filename: impl AsRef<Path>,
) -> Result<()> {
    let rows = chain.post_burn_in(burn_in);
    if let Some(bad) = derived.iter().find(|d| d.values.len() != rows.len()) {
        return Err(McmcError::Usage(format!(
            "derived quantity '{}' has {} values for {} samples",
            bad.name,
            bad.values.len(),
            rows.len()
        )));
    }
    let mut wtr = Writer::from_writer(File::create(filename)?);

    let mut header: Vec<String> = FIXED_COLUMNS.iter().map(|s| s.to_string()).collect();
    header.extend(chain.names().iter().cloned());
    header.extend(derived.iter().map(|d| format!("{DERIVED_PREFIX}{}", d.name)));
    wtr.write_record(&header)?;

    for (entry, sample) in rows.iter().enumerate() {
        let mut row = vec![
            entry.to_string(),
            sample.step.to_string(),
            sample.weight.to_string(),
            sample.nll.to_string(),
        ];
        row.extend(sample.values.iter().map(|v| v.to_string()));
        row.extend(derived.iter().map(|d| d.values[entry].to_string()));
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    log::debug!("saved {} chain samples", rows.len());
    Ok(())
}

/// Reads a chain written by [`save_chain_csv`]. Derived columns are skipped.
pub fn load_chain_csv(filename: impl AsRef<Path>) -> Result<Chain> {
    let mut rdr = Reader::from_reader(File::open(filename)?);
    let headers = rdr.headers()?.clone();
    if headers.len() < FIXED_COLUMNS.len()
        || headers.iter().zip(FIXED_COLUMNS).any(|(h, f)| h != f)
    {
        return Err(invalid(format!(
            "expected leading columns {FIXED_COLUMNS:?}, found {:?}",
            headers.iter().collect::<Vec<_>>()
        )));
    }
    let names: Vec<String> = headers
        .iter()
        .skip(FIXED_COLUMNS.len())
        .take_while(|h| !h.starts_with(DERIVED_PREFIX))
        .map(str::to_string)
        .collect();
    let dim = names.len();

    let mut samples = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record?;
        let mut values = Vec::with_capacity(dim);
        for (k, name) in names.iter().enumerate() {
            values.push(parse(&record[FIXED_COLUMNS.len() + k], name, row)?);
        }
        samples.push(Sample {
            values,
            nll: parse(&record[3], "nll", row)?,
            step: parse(&record[1], "step", row)?,
            weight: parse(&record[2], "weight", row)?,
        });
    }
    Ok(Chain::from_samples(names, samples))
}

/// Saves a covariance matrix as a labelled square table.
pub fn save_covariance_csv(cov: &CovarianceMatrix, filename: impl AsRef<Path>) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(filename)?);
    let mut header = vec!["name".to_string()];
    header.extend(cov.names().iter().cloned());
    wtr.write_record(&header)?;
    for (i, name) in cov.names().iter().enumerate() {
        let mut row = vec![name.clone()];
        row.extend((0..cov.dim()).map(|j| cov.get(i, j).to_string()));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Reads a covariance matrix written by [`save_covariance_csv`].
pub fn load_covariance_csv(filename: impl AsRef<Path>) -> Result<CovarianceMatrix> {
    let mut rdr = Reader::from_reader(File::open(filename)?);
    let headers = rdr.headers()?.clone();
    let names: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
    let n = names.len();
    let mut matrix = DMatrix::<f64>::zeros(n, n);
    let mut rows = 0;
    for (i, record) in rdr.records().enumerate() {
        let record = record?;
        if i >= n || record.len() != n + 1 || record[0] != names[i] {
            return Err(invalid(format!("covariance row {i} does not match the header")));
        }
        for j in 0..n {
            matrix[(i, j)] = parse(&record[j + 1], &names[j], i)?;
        }
        rows += 1;
    }
    if rows != n {
        return Err(invalid(format!("covariance has {rows} rows for {n} columns")));
    }
    CovarianceMatrix::new(names, matrix)
}
