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

//! Partition filter expressions.
//!
//! A filter string like `"p1=a;p2=b"` selects partitions group by group:
//! `;` separates groups combined with OR, and `/` (or `,`) separates
//! `key=value` pairs combined with AND inside one group. The parsed form
//! renders as `(p1=a) OR (p2=b)` for the reorder read path.

use std::fmt;

use itertools::Itertools;

use crate::table::RowData;
use crate::{CompactionError, Result};

/// Disjunction of partition-value groups: `(k=v AND ...) OR (...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPredicate {
    groups: Vec<Vec<(String, String)>>,
}

impl PartitionPredicate {
    /// Parses a filter string. Blank input means "no filter" and yields
    /// `None`; a segment without `=` is an invalid argument.
    pub fn parse(spec: &str) -> Result<Option<Self>> {
        let mut groups = Vec::new();
        for segment in spec.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let mut group = Vec::new();
            for pair in segment.split(['/', ',']) {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    CompactionError::InvalidArgument(format!(
                        "malformed partition filter segment: \"{pair}\""
                    ))
                })?;
                group.push((key.trim().to_owned(), value.trim().to_owned()));
            }
            if !group.is_empty() {
                groups.push(group);
            }
        }
        if groups.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Self { groups }))
        }
    }

    pub fn groups(&self) -> &[Vec<(String, String)>] {
        &self.groups
    }

    /// True if any group's equalities all hold against the given
    /// partition-column values.
    pub fn matches_pairs(&self, pairs: &[(String, String)]) -> bool {
        self.groups.iter().any(|group| {
            group.iter().all(|(key, value)| {
                pairs
                    .iter()
                    .any(|(pair_key, pair_value)| pair_key == key && pair_value == value)
            })
        })
    }

    /// Row-level evaluation for the reorder read path.
    pub fn matches_row(&self, row: &RowData) -> bool {
        self.groups.iter().any(|group| {
            group
                .iter()
                .all(|(key, value)| row.get(key) == Some(value.as_str()))
        })
    }
}

impl fmt::Display for PartitionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .groups
            .iter()
            .map(|group| {
                let conjunction = group
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .join(" AND ");
                format!("({conjunction})")
            })
            .join(" OR ");
        write!(f, "{rendered}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_blank_means_no_filter() {
        assert_eq!(PartitionPredicate::parse("").unwrap(), None);
        assert_eq!(PartitionPredicate::parse("  ;  ").unwrap(), None);
    }

    #[test]
    fn test_parse_or_groups() {
        let predicate = PartitionPredicate::parse("p1=a;p2=b").unwrap().unwrap();
        assert_eq!(predicate.groups().len(), 2);
        assert_eq!(predicate.to_string(), "(p1=a) OR (p2=b)");
    }

    #[test]
    fn test_parse_and_within_group() {
        let predicate = PartitionPredicate::parse("p1=a/p2=b").unwrap().unwrap();
        assert_eq!(predicate.groups().len(), 1);
        assert_eq!(predicate.to_string(), "(p1=a AND p2=b)");

        // comma works the same as slash
        let predicate = PartitionPredicate::parse("p1=a,p2=b;p3=c").unwrap().unwrap();
        assert_eq!(predicate.to_string(), "(p1=a AND p2=b) OR (p3=c)");
    }

    #[test]
    fn test_parse_malformed_segment() {
        let err = PartitionPredicate::parse("p1").unwrap_err();
        assert!(matches!(err, CompactionError::InvalidArgument(_)));
    }

    #[test]
    fn test_matches_rows_against_fixture_partitions() {
        // fixture partitions {p1=a}, {p2=b}, {p3=c}
        let rows = [
            RowData::new(vec![("p1".to_owned(), "a".to_owned())]),
            RowData::new(vec![("p2".to_owned(), "b".to_owned())]),
            RowData::new(vec![("p3".to_owned(), "c".to_owned())]),
        ];
        let predicate = PartitionPredicate::parse("p1=a;p2=b").unwrap().unwrap();
        let selected = rows.iter().filter(|row| predicate.matches_row(row)).count();
        assert_eq!(selected, 2);
    }

    #[test]
    fn test_matches_pairs_requires_whole_group() {
        let predicate = PartitionPredicate::parse("p1=a/p2=b").unwrap().unwrap();
        assert!(predicate.matches_pairs(&[
            ("p1".to_owned(), "a".to_owned()),
            ("p2".to_owned(), "b".to_owned()),
        ]));
        assert!(!predicate.matches_pairs(&[("p1".to_owned(), "a".to_owned())]));
    }
}
