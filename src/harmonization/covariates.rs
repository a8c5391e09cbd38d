//! Row-aligned covariate table.
//!
//! Each column is either categorical (string labels) or continuous (`f64`).
//! Numeric columns can still be read as labels, so integer-coded batch or
//! sex columns work without conversion.

use crate::harmonization::error::HarmonizationError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// A single covariate column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CovariateColumn {
    /// Label-valued column (batch/site, sex, diagnosis...).
    Categorical(Vec<String>),
    /// Numeric column (age, total intracranial volume...).
    Continuous(Vec<f64>),
}

impl CovariateColumn {
    /// Number of rows in the column.
    pub fn len(&self) -> usize {
        match self {
            CovariateColumn::Categorical(values) => values.len(),
            CovariateColumn::Continuous(values) => values.len(),
        }
    }

    /// Check if the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select_rows(&self, rows: &[usize]) -> Self {
        match self {
            CovariateColumn::Categorical(values) => {
                CovariateColumn::Categorical(rows.iter().map(|&r| values[r].clone()).collect())
            }
            CovariateColumn::Continuous(values) => {
                CovariateColumn::Continuous(rows.iter().map(|&r| values[r]).collect())
            }
        }
    }
}

/// Format a numeric code as a category label (`2.0` -> `"2"`).
fn numeric_label(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Covariate table keyed by column name, rows aligned with the feature matrix.
///
/// Column order is preserved as inserted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "IndexMap<String, CovariateColumn>",
    into = "IndexMap<String, CovariateColumn>"
)]
pub struct CovariateTable {
    n_samples: usize,
    columns: IndexMap<String, CovariateColumn>,
}

impl TryFrom<IndexMap<String, CovariateColumn>> for CovariateTable {
    type Error = HarmonizationError;

    fn try_from(columns: IndexMap<String, CovariateColumn>) -> Result<Self, Self::Error> {
        let mut table = CovariateTable::new();
        for (name, column) in columns {
            table.insert(name, column)?;
        }
        Ok(table)
    }
}

impl From<CovariateTable> for IndexMap<String, CovariateColumn> {
    fn from(table: CovariateTable) -> Self {
        table.columns
    }
}

impl CovariateTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a categorical column (builder style).
    pub fn with_categorical<S: Into<String>>(
        mut self,
        name: &str,
        values: impl IntoIterator<Item = S>,
    ) -> Result<Self, HarmonizationError> {
        let values = values.into_iter().map(Into::into).collect();
        self.insert(name.to_string(), CovariateColumn::Categorical(values))?;
        Ok(self)
    }

    /// Add a continuous column (builder style).
    pub fn with_continuous(
        mut self,
        name: &str,
        values: impl IntoIterator<Item = f64>,
    ) -> Result<Self, HarmonizationError> {
        let values = values.into_iter().collect();
        self.insert(name.to_string(), CovariateColumn::Continuous(values))?;
        Ok(self)
    }

    /// Insert or replace a column. The first column fixes the row count.
    pub fn insert(
        &mut self,
        name: String,
        column: CovariateColumn,
    ) -> Result<(), HarmonizationError> {
        let replacing_only_column = self.columns.len() == 1 && self.columns.contains_key(&name);
        if !self.columns.is_empty() && !replacing_only_column && column.len() != self.n_samples {
            return Err(HarmonizationError::InvalidInput(format!(
                "covariate column '{}' has {} rows, table has {}",
                name,
                column.len(),
                self.n_samples
            )));
        }
        self.n_samples = column.len();
        self.columns.insert(name, column);
        Ok(())
    }

    /// Number of samples (rows).
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Number of columns.
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// Column names in insertion order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Check if a column exists.
    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&CovariateColumn> {
        self.columns.get(name)
    }

    /// Numeric values of a continuous column.
    ///
    /// Returns `None` if the column is absent or categorical.
    pub fn continuous(&self, name: &str) -> Option<&[f64]> {
        match self.columns.get(name)? {
            CovariateColumn::Continuous(values) => Some(values),
            CovariateColumn::Categorical(_) => None,
        }
    }

    /// Values of a column as category labels.
    ///
    /// Numeric columns are formatted, so `1.0` becomes `"1"`.
    pub fn labels(&self, name: &str) -> Option<Vec<String>> {
        match self.columns.get(name)? {
            CovariateColumn::Categorical(values) => Some(values.clone()),
            CovariateColumn::Continuous(values) => {
                Some(values.iter().map(|&v| numeric_label(v)).collect())
            }
        }
    }

    /// Overwrite an existing continuous column in place.
    ///
    /// This is the write-back used when a derived covariate has been
    /// harmonized; every other column is left untouched.
    pub fn set_continuous(&mut self, name: &str, values: Vec<f64>) -> Result<(), HarmonizationError> {
        if values.len() != self.n_samples {
            return Err(HarmonizationError::InvalidInput(format!(
                "cannot write {} values into covariate '{}' with {} rows",
                values.len(),
                name,
                self.n_samples
            )));
        }
        match self.columns.get_mut(name) {
            Some(CovariateColumn::Continuous(current)) => {
                *current = values;
                Ok(())
            }
            Some(CovariateColumn::Categorical(_)) => Err(HarmonizationError::InvalidInput(format!(
                "covariate '{}' is categorical and cannot hold harmonized values",
                name
            ))),
            None => Err(HarmonizationError::MissingField(name.to_string())),
        }
    }

    /// Build a new table from a subset of rows (in the given order).
    pub fn select_rows(&self, rows: &[usize]) -> Result<Self, HarmonizationError> {
        if let Some(&bad) = rows.iter().find(|&&r| r >= self.n_samples) {
            return Err(HarmonizationError::InvalidInput(format!(
                "row {} out of bounds for table with {} rows",
                bad, self.n_samples
            )));
        }
        Ok(Self {
            n_samples: rows.len(),
            columns: self
                .columns
                .iter()
                .map(|(name, column)| (name.clone(), column.select_rows(rows)))
                .collect(),
        })
    }

    /// Read a table from CSV with a header row.
    ///
    /// Columns listed in `categorical` are kept as labels; every other column
    /// must parse as `f64`.
    pub fn from_csv_reader<R: Read>(
        reader: R,
        categorical: &[&str],
    ) -> Result<Self, HarmonizationError> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers: Vec<String> = csv_reader.headers()?.iter().map(str::to_string).collect();

        let mut raw: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for record in csv_reader.records() {
            let record = record?;
            for (i, field) in record.iter().enumerate() {
                if let Some(column) = raw.get_mut(i) {
                    column.push(field.to_string());
                }
            }
        }

        let mut table = CovariateTable::new();
        for (name, values) in headers.into_iter().zip(raw) {
            let column = if categorical.contains(&name.as_str()) {
                CovariateColumn::Categorical(values)
            } else {
                let parsed = values
                    .iter()
                    .enumerate()
                    .map(|(row, v)| {
                        v.parse::<f64>().map_err(|_| {
                            HarmonizationError::InvalidInput(format!(
                                "column '{}' row {}: '{}' is not numeric",
                                name, row, v
                            ))
                        })
                    })
                    .collect::<Result<Vec<f64>, _>>()?;
                CovariateColumn::Continuous(parsed)
            };
            table.insert(name, column)?;
        }
        Ok(table)
    }
}
