//! Flattening drained counter tables into emittable records.
//!
//! Two configuration axes meet here. Aggregation scope decides what the
//! snapshot contains -- one scope per routing tag, or the single sentinel
//! scope `all`. Output routing decides how scopes map onto emitted records:
//! one record per scope under a rewritten tag, or a single merged record in
//! which every field is prefixed by its scope. Averages are computed at
//! format time; statistics never observed are omitted outright.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::accumulator::Stats;
use crate::config::{Aggregate, Config};
use crate::engine::FieldMap;
use crate::table::Table;

/// The sentinel scope used when aggregation collapses all routing tags.
pub(crate) const ALL_SCOPE: &str = "all";

/// Turns a drained [`Table`] snapshot into `(output tag, fields)` pairs.
#[derive(Debug)]
pub struct OutputFormatter {
    config: Arc<Config>,
}

impl OutputFormatter {
    pub(crate) fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Produce the records for one flushed snapshot, in scope order.
    #[must_use]
    pub fn format(&self, snapshot: &Table) -> Vec<(String, FieldMap)> {
        let mut scopes: Vec<&String> = snapshot.keys().collect();
        scopes.sort();

        if self.config.output_per_tag {
            if self.config.aggregate == Aggregate::All {
                return snapshot
                    .get(ALL_SCOPE)
                    .map(|groups| {
                        let mut fields = FieldMap::default();
                        self.append_fields(groups, &mut fields, "");
                        vec![(self.output_tag(ALL_SCOPE), fields)]
                    })
                    .unwrap_or_default();
            }
            scopes
                .into_iter()
                .map(|scope| {
                    let mut fields = FieldMap::default();
                    self.append_fields(&snapshot[scope], &mut fields, "");
                    (self.output_tag(scope), fields)
                })
                .collect()
        } else {
            let mut fields = FieldMap::default();
            if self.config.aggregate == Aggregate::All {
                if let Some(groups) = snapshot.get(ALL_SCOPE) {
                    self.append_fields(groups, &mut fields, "");
                }
            } else {
                for scope in scopes {
                    let prefix =
                        format!("{}{}", self.stripped_tag(scope), self.config.delimiter);
                    self.append_fields(&snapshot[scope], &mut fields, &prefix);
                }
            }
            vec![(self.config.tag.clone(), fields)]
        }
    }

    /// Flatten one scope's groups into `out`, each field name prefixed with
    /// `key_prefix`.
    fn append_fields(
        &self,
        groups: &FxHashMap<String, Stats>,
        out: &mut FieldMap,
        key_prefix: &str,
    ) {
        let c = &self.config;
        for (group_key, stats) in groups {
            // Count fields attach the suffix directly to the group key; the
            // named statistics interpose the delimiter and their field name.
            let keyed = if group_key.is_empty() {
                String::new()
            } else {
                format!("{group_key}{delim}", delim = c.delimiter)
            };
            out.insert(
                format!("{key_prefix}{group_key}{suffix}", suffix = c.count_suffix),
                stats.count as f64,
            );
            if let (Some(min_key), Some(min)) = (&c.min_key, stats.min) {
                out.insert(
                    format!("{key_prefix}{keyed}{min_key}{suffix}", suffix = c.min_suffix),
                    min,
                );
            }
            if let (Some(max_key), Some(max)) = (&c.max_key, stats.max) {
                out.insert(
                    format!("{key_prefix}{keyed}{max_key}{suffix}", suffix = c.max_suffix),
                    max,
                );
            }
            if let (Some(avg_key), Some(sum)) = (&c.avg_key, stats.sum) {
                if stats.count > 0 {
                    out.insert(
                        format!("{key_prefix}{keyed}{avg_key}{suffix}", suffix = c.avg_suffix),
                        sum / stats.count as f64,
                    );
                }
            }
        }
    }

    /// Output tag for one scope in per-tag routing: strip the configured
    /// prefix, then prepend the configured one.
    fn output_tag(&self, scope: &str) -> String {
        let stripped = self.stripped_tag(scope);
        match &self.config.add_tag_prefix {
            Some(prefix) => format!("{prefix}.{stripped}"),
            None => stripped.to_owned(),
        }
    }

    fn stripped_tag<'a>(&self, tag: &'a str) -> &'a str {
        if let Some(remove) = &self.config.remove_tag_prefix {
            let prefixed = format!("{remove}.");
            if tag.starts_with(&prefixed) && tag.len() > prefixed.len() {
                return &tag[prefixed.len()..];
            }
        }
        tag
    }
}
