//! Raw extraction plans.
//!
//! An [`Extract`] describes how one source table or query is copied into the
//! raw namespace: optionally split into half-open date windows, and each
//! window read in fixed-size row chunks under a stable ordering.

use std::ops::Range;

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::{Error, Result, derive::check_range};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ExtractSource {
  /// The listed columns of a table, or all of them when the list is empty.
  Table {
    table:   String,
    #[serde(default)]
    columns: Vec<String>,
  },
  /// A single SELECT.
  Query { query: String },
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Grain {
  Day,
  Month,
}

/// Rows with `start <= column < end`, split at every `grain` boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
  pub column: String,
  pub grain:  Grain,
  pub start:  NaiveDate,
  pub end:    NaiveDate,
}

impl Partition {
  /// Half-open windows covering `[start, end)` without gaps or overlap.
  /// Month windows break on the first of each month, so the first and last
  /// window may be partial.
  pub fn windows(&self) -> Result<Vec<(NaiveDate, NaiveDate)>> {
    let what = format!("partition on {}", self.column);
    check_range(what.clone(), self.start, self.end)?;

    let mut windows = Vec::new();
    let mut from = self.start;
    while from < self.end {
      let next = match self.grain {
        Grain::Day => from.checked_add_days(Days::new(1)),
        Grain::Month => from
          .with_day(1)
          .and_then(|first| first.checked_add_months(Months::new(1))),
      }
      .ok_or_else(|| Error::InvalidDateRange {
        what:  what.clone(),
        start: self.start,
        end:   self.end,
      })?;
      let to = next.min(self.end);
      windows.push((from, to));
      from = to;
    }
    Ok(windows)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extract {
  pub source:     ExtractSource,
  /// Columns giving a total order over the rows; chunks are read in it.
  pub order_by:   String,
  pub partition:  Option<Partition>,
  /// Rows per chunk. A window is read in one go when unset.
  pub chunk_rows: Option<u64>,
}

impl Extract {
  pub fn table(table: impl Into<String>, order_by: impl Into<String>) -> Self {
    Self::from_source(ExtractSource::Table { table: table.into(), columns: Vec::new() }, order_by)
  }

  pub fn query(query: impl Into<String>, order_by: impl Into<String>) -> Self {
    Self::from_source(ExtractSource::Query { query: query.into() }, order_by)
  }

  fn from_source(source: ExtractSource, order_by: impl Into<String>) -> Self {
    Self { source, order_by: order_by.into(), partition: None, chunk_rows: None }
  }

  /// Narrow a table extract to the given columns. No effect on a query.
  pub fn columns<I, S>(mut self, names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    if let ExtractSource::Table { columns, .. } = &mut self.source {
      columns.extend(names.into_iter().map(Into::into));
    }
    self
  }

  pub fn partition(
    mut self,
    column: impl Into<String>,
    grain: Grain,
    start: NaiveDate,
    end: NaiveDate,
  ) -> Self {
    self.partition = Some(Partition { column: column.into(), grain, start, end });
    self
  }

  pub fn chunked(mut self, rows: u64) -> Self {
    self.chunk_rows = Some(rows.max(1));
    self
  }

  pub fn source_table(&self) -> Option<&str> {
    match &self.source {
      ExtractSource::Table { table, .. } => Some(table),
      ExtractSource::Query { .. } => None,
    }
  }

  pub fn base_query(&self) -> String {
    match &self.source {
      ExtractSource::Table { table, columns } => {
        let columns = if columns.is_empty() { "*".to_owned() } else { columns.join(", ") };
        format!("SELECT {columns} FROM {table}")
      }
      ExtractSource::Query { query } => query.trim().trim_end_matches(';').trim_end().to_owned(),
    }
  }

  /// One query per partition window, or the base query alone.
  pub fn window_queries(&self) -> Result<Vec<String>> {
    let base = self.base_query();
    let Some(partition) = &self.partition else {
      return Ok(vec![base]);
    };
    let column = &partition.column;
    Ok(
      partition
        .windows()?
        .into_iter()
        .map(|(from, to)| {
          format!("SELECT * FROM ({base}) WHERE {column} >= '{from}' AND {column} < '{to}'")
        })
        .collect(),
    )
  }

  /// Chunks for a window holding `rows` rows.
  pub fn chunks(&self, rows: u64) -> Vec<Range<u64>> {
    plan_chunks(rows, self.chunk_rows.unwrap_or(rows))
  }

  pub fn chunk_query(&self, window: &str, chunk: &Range<u64>) -> String {
    format!(
      "SELECT * FROM ({window}) ORDER BY {order} LIMIT {limit} OFFSET {offset}",
      order = self.order_by,
      limit = chunk.end - chunk.start,
      offset = chunk.start,
    )
  }
}

/// Split `rows` into consecutive ranges of at most `max_rows`.
pub fn plan_chunks(rows: u64, max_rows: u64) -> Vec<Range<u64>> {
  let max_rows = max_rows.max(1);
  let mut chunks = Vec::new();
  let mut start = 0;
  while start < rows {
    let end = (start + max_rows).min(rows);
    chunks.push(start..end);
    start = end;
  }
  chunks
}

#[cfg(test)]
mod tests {
  use super::*;

  fn date(y: i32, m: u32, d: u32) -> NaiveDate { NaiveDate::from_ymd_opt(y, m, d).unwrap() }

  #[test]
  fn month_windows_are_half_open_and_clipped() {
    let p = Partition {
      column: "night_date".into(),
      grain:  Grain::Month,
      start:  date(2024, 1, 15),
      end:    date(2024, 3, 10),
    };
    assert_eq!(
      p.windows().unwrap(),
      vec![
        (date(2024, 1, 15), date(2024, 2, 1)),
        (date(2024, 2, 1), date(2024, 3, 1)),
        (date(2024, 3, 1), date(2024, 3, 10)),
      ]
    );
  }

  #[test]
  fn day_windows_cover_each_date_once() {
    let p = Partition {
      column: "night_date".into(),
      grain:  Grain::Day,
      start:  date(2024, 2, 27),
      end:    date(2024, 3, 2),
    };
    let windows = p.windows().unwrap();
    assert_eq!(windows.len(), 4);
    assert!(windows.windows(2).all(|w| w[0].1 == w[1].0));
  }

  #[test]
  fn empty_partition_is_rejected() {
    let p = Partition {
      column: "night_date".into(),
      grain:  Grain::Day,
      start:  date(2024, 3, 1),
      end:    date(2024, 3, 1),
    };
    assert!(matches!(p.windows(), Err(Error::InvalidDateRange { .. })));
  }

  #[test]
  fn base_query_per_mode() {
    assert_eq!(Extract::table("hotel", "hotel_id").base_query(), "SELECT * FROM hotel");
    assert_eq!(
      Extract::table("hotel", "hotel_id").columns(["hotel_id", "name"]).base_query(),
      "SELECT hotel_id, name FROM hotel"
    );
    assert_eq!(
      Extract::query("SELECT 1 AS n; ", "n").base_query(),
      "SELECT 1 AS n"
    );
  }

  #[test]
  fn partitioned_extract_wraps_the_base_query() {
    let e = Extract::query("SELECT * FROM room_night WHERE availability = 'OCCUPIED'", "room_id")
      .partition("night_date", Grain::Month, date(2024, 1, 1), date(2024, 3, 1));
    let windows = e.window_queries().unwrap();
    assert_eq!(windows.len(), 2);
    assert!(windows[1].ends_with("night_date >= '2024-02-01' AND night_date < '2024-03-01'"));
  }

  #[test]
  fn chunks_tile_the_row_count() {
    assert_eq!(plan_chunks(10, 4), vec![0..4, 4..8, 8..10]);
    assert!(plan_chunks(0, 4).is_empty());
    assert_eq!(Extract::table("t", "id").chunks(7), vec![0..7]);

    let e = Extract::table("t", "id").chunked(3);
    assert_eq!(
      e.chunk_query("SELECT * FROM t", &(3..6)),
      "SELECT * FROM (SELECT * FROM t) ORDER BY id LIMIT 3 OFFSET 3"
    );
  }
}
