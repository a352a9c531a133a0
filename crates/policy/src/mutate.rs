use urlinfo_contracts::{
    DeleteRequest, DomainRecord, PathRecord, QueryEntryUpdate, QueryParamEntry, SetPathRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Nothing matched; the stored record must not be rewritten.
    Unchanged,
    Updated(DomainRecord),
    RemoveDomain,
}

impl DeleteOutcome {
    pub fn deleted(&self) -> bool {
        !matches!(self, DeleteOutcome::Unchanged)
    }
}

/// Produces the next record for a set request.
///
/// Without a path the record is reset to `{updated, safe}`, dropping every
/// path override. With a path that already exists the incoming query entries
/// are merged by identity; otherwise a new path entry is created next to the
/// existing ones.
pub fn apply_set(record: Option<DomainRecord>, request: SetPathRequest, now: i64) -> DomainRecord {
    let updated = request.updated.unwrap_or(now);
    let SetPathRequest {
        path,
        safe,
        query_params,
        ..
    } = request;

    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return DomainRecord::new(updated, safe);
    };

    let mut record = record.unwrap_or_default();
    record.updated = updated;

    let next = match record.paths.remove(&path) {
        Some(existing) => merge_path(existing, safe, query_params, updated),
        None => new_path(safe, query_params, updated),
    };
    record.paths.insert(path, next);
    record
}

/// Produces the outcome of a delete request against the stored record.
pub fn apply_delete(
    record: Option<DomainRecord>,
    request: &DeleteRequest,
    now: i64,
) -> DeleteOutcome {
    let Some(mut record) = record.filter(|r| r.safe.is_some() || !r.paths.is_empty()) else {
        return DeleteOutcome::Unchanged;
    };

    let Some(path) = request.path.as_deref().filter(|p| !p.is_empty()) else {
        return DeleteOutcome::RemoveDomain;
    };

    if !record.paths.contains_key(path) {
        return DeleteOutcome::Unchanged;
    }

    if request.query_params.is_empty() {
        record.paths.remove(path);
        record.updated = now;
        return DeleteOutcome::Updated(record);
    }

    let markers = request
        .query_params
        .iter()
        .map(QueryEntryUpdate::delete_marker)
        .collect::<Vec<_>>();

    DeleteOutcome::Updated(apply_set(
        Some(record),
        SetPathRequest {
            path: Some(path.to_string()),
            safe: None,
            query_params: markers,
            updated: None,
        },
        now,
    ))
}

fn merge_path(
    existing: PathRecord,
    safe: Option<bool>,
    incoming: Vec<QueryEntryUpdate>,
    updated: i64,
) -> PathRecord {
    let query_params = incoming
        .into_iter()
        .fold(existing.query_params, |entries, entry| {
            let entry_safe = entry.safe.or(safe);
            merge_entry(entries, entry, entry_safe, updated)
        });

    PathRecord {
        updated,
        safe: safe.or(existing.safe),
        query_params,
    }
}

fn new_path(safe: Option<bool>, incoming: Vec<QueryEntryUpdate>, updated: i64) -> PathRecord {
    let query_params = incoming.into_iter().fold(Vec::new(), |entries, entry| {
        let entry_safe = entry.safe;
        let entry_updated = entry.updated.unwrap_or(updated);
        merge_entry(entries, entry, entry_safe, entry_updated)
    });

    PathRecord {
        updated,
        safe,
        query_params,
    }
}

fn merge_entry(
    mut entries: Vec<QueryParamEntry>,
    incoming: QueryEntryUpdate,
    safe: Option<bool>,
    updated: i64,
) -> Vec<QueryParamEntry> {
    let matched = entries
        .iter()
        .any(|e| e.matches(&incoming.key, &incoming.value));

    match (matched, incoming.delete) {
        (true, true) => entries
            .into_iter()
            .filter(|e| !e.matches(&incoming.key, &incoming.value))
            .collect(),
        (true, false) => entries
            .into_iter()
            .map(|e| {
                if e.matches(&incoming.key, &incoming.value) {
                    QueryParamEntry { updated, safe, ..e }
                } else {
                    e
                }
            })
            .collect(),
        (false, false) => {
            entries.push(QueryParamEntry {
                key: incoming.key,
                value: incoming.value,
                updated,
                safe,
            });
            entries
        }
        (false, true) => entries,
    }
}
