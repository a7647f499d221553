//! Candidate keys: the keys a populated table could hold given the
//! upstream rows currently in the store.

use std::collections::{BTreeMap, HashMap};

use neuropipe_core::{
    Key, KeyFilter, PipelineError, PipelineResult, Registry, Restriction, StorageView, TableKey,
    TableKind,
};

use crate::merge::merge_id_for;

/// A candidate key and the upstream rows it was joined from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: Key,
    /// One upstream row per upstream table (one source row for merge tables).
    pub parents: Vec<TableKey>,
}

/// Candidate keys of `table`, sorted by key.
///
/// Regular tables take the natural join of their upstream primary keys;
/// merge tables take the union of their sources, one `merge_id` per source
/// row.
pub fn candidate_keys<V: StorageView + ?Sized>(
    registry: &Registry,
    view: &V,
    table: &str,
    restriction: Option<&Restriction>,
) -> PipelineResult<Vec<Candidate>> {
    let descriptor = registry.resolve(table)?;
    if !descriptor.kind.is_populated() {
        return Err(PipelineError::schema(
            table,
            format!("{} tables are not populated by the engine", descriptor.kind.label()),
        ));
    }
    if let Some(restriction) = restriction {
        restriction.check_attributes(table, &registry.candidate_attributes(table)?)?;
    }

    let joined = if descriptor.kind == TableKind::Merge {
        merge_union(view, &descriptor.upstream)?
    } else {
        natural_join(registry, view, &descriptor.upstream)?
    };

    Ok(joined
        .into_iter()
        .filter(|(key, _)| restriction.is_none_or(|r| r.matches(key)))
        .map(|(key, parents)| Candidate { key, parents })
        .collect())
}

/// Hash join of upstream primary keys, one upstream table at a time.
fn natural_join<V: StorageView + ?Sized>(
    registry: &Registry,
    view: &V,
    upstream: &[String],
) -> PipelineResult<BTreeMap<Key, Vec<TableKey>>> {
    let mut partials: Vec<(Key, Vec<TableKey>)> = vec![(Key::new(), Vec::new())];
    let mut joined_attributes: Vec<String> = Vec::new();

    for parent in upstream {
        let primary_key = &registry.resolve(parent)?.primary_key;
        let shared: Vec<&String> = primary_key
            .iter()
            .filter(|a| joined_attributes.contains(a))
            .collect();

        let mut buckets: HashMap<Key, Vec<Key>> = HashMap::new();
        for row in view.read_rows(parent, &KeyFilter::All)? {
            let key = row.key.project(primary_key);
            buckets.entry(key.project(&shared)).or_default().push(key);
        }

        let mut next = Vec::new();
        for (key, parents) in &partials {
            let Some(matches) = buckets.get(&key.project(&shared)) else {
                continue;
            };
            for upstream_key in matches {
                let mut lineage = parents.clone();
                lineage.push(TableKey::new(parent, upstream_key.clone()));
                next.push((key.join(upstream_key)?, lineage));
            }
        }
        partials = next;
        joined_attributes.extend(primary_key.iter().filter(|a| !shared.contains(a)).cloned());
    }

    Ok(partials.into_iter().collect())
}

fn merge_union<V: StorageView + ?Sized>(
    view: &V,
    sources: &[String],
) -> PipelineResult<BTreeMap<Key, Vec<TableKey>>> {
    let mut out = BTreeMap::new();
    for source in sources {
        for row in view.read_rows(source, &KeyFilter::All)? {
            out.insert(
                merge_id_for(source, &row.key),
                vec![TableKey::new(source, row.key)],
            );
        }
    }
    Ok(out)
}
