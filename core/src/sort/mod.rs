/*
 * Copyright 2025 bucketloom
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Order specifications for the reorder rewrite path.

use std::fmt;

use async_trait::async_trait;

use crate::table::RowStream;
use crate::{CompactionError, Result};

/// Sort strategy applied during a compaction-with-reorder job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    /// Pure compaction, no reordering.
    None,
    /// Plain lexicographic multi-column order.
    Order,
    /// Z-order space-filling curve.
    Zorder,
    /// Hilbert space-filling curve.
    Hilbert,
}

impl OrderType {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "order" => Ok(Self::Order),
            "zorder" => Ok(Self::Zorder),
            "hilbert" => Ok(Self::Hilbert),
            other => Err(CompactionError::InvalidArgument(format!(
                "unknown order strategy: \"{other}\""
            ))),
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Order => "order",
            Self::Zorder => "zorder",
            Self::Hilbert => "hilbert",
        };
        write!(f, "{name}")
    }
}

/// A bound order strategy plus its sort-by columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub order_type: OrderType,
    pub columns: Vec<String>,
}

impl SortSpec {
    /// Binds the procedure's order arguments, before any work starts.
    ///
    /// Blank arguments count as absent. `none` with a non-empty column list
    /// is rejected, as is any other strategy without columns.
    pub fn parse(order_strategy: Option<&str>, order_by: Option<&str>) -> Result<Self> {
        let order_type = match order_strategy.map(str::trim) {
            Some(name) if !name.is_empty() => OrderType::parse(name)?,
            _ => OrderType::None,
        };
        let columns: Vec<String> = order_by
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|column| !column.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        if order_type == OrderType::None && !columns.is_empty() {
            return Err(CompactionError::InvalidArgument(
                "order_strategy \"none\" cannot work with order_by columns".to_owned(),
            ));
        }
        if order_type != OrderType::None && columns.is_empty() {
            return Err(CompactionError::InvalidArgument(format!(
                "order strategy \"{order_type}\" requires order_by columns"
            )));
        }
        Ok(Self {
            order_type,
            columns,
        })
    }
}

/// External row-level sort. The core never interprets sort semantics; it
/// only routes the filtered row stream through here before the
/// dynamic-overwrite write-back.
#[async_trait]
pub trait RowSorter: Send + Sync {
    async fn sort(&self, spec: &SortSpec, rows: RowStream) -> Result<RowStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_type_names() {
        assert_eq!(OrderType::parse("zorder").unwrap(), OrderType::Zorder);
        assert_eq!(OrderType::parse("ZORDER").unwrap(), OrderType::Zorder);
        assert_eq!(OrderType::parse("hilbert").unwrap(), OrderType::Hilbert);
        assert!(matches!(
            OrderType::parse("shuffle").unwrap_err(),
            CompactionError::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_none_with_columns_rejected() {
        let err = SortSpec::parse(None, Some("a,b")).unwrap_err();
        assert!(matches!(err, CompactionError::InvalidArgument(_)), "{err}");

        let err = SortSpec::parse(Some("none"), Some("a")).unwrap_err();
        assert!(matches!(err, CompactionError::InvalidArgument(_)), "{err}");
    }

    #[test]
    fn test_strategy_without_columns_rejected() {
        let err = SortSpec::parse(Some("zorder"), None).unwrap_err();
        assert!(matches!(err, CompactionError::InvalidArgument(_)), "{err}");

        let err = SortSpec::parse(Some("order"), Some(" , ")).unwrap_err();
        assert!(matches!(err, CompactionError::InvalidArgument(_)), "{err}");
    }

    #[test]
    fn test_blank_arguments_default_to_none() {
        let spec = SortSpec::parse(None, None).unwrap();
        assert_eq!(spec.order_type, OrderType::None);
        assert!(spec.columns.is_empty());

        let spec = SortSpec::parse(Some("  "), Some("")).unwrap();
        assert_eq!(spec.order_type, OrderType::None);
    }

    #[test]
    fn test_columns_are_trimmed() {
        let spec = SortSpec::parse(Some("zorder"), Some(" a , b ")).unwrap();
        assert_eq!(spec.columns, vec!["a".to_owned(), "b".to_owned()]);
    }
}
