use urlinfo_contracts::{BlockedError, DomainRecord, Verdict};

/// Computes the verdict for `path` and `query` under `record`.
///
/// Safety cascades: the domain sets the default, an exact path entry
/// overrides it, and each requested query pair is judged by the stored
/// entries sharing its identity (falling back to the path verdict when none
/// match). The first pair judged unsafe blocks the request.
pub fn resolve(
    record: Option<&DomainRecord>,
    path: Option<&str>,
    query: &[(String, String)],
) -> Result<Verdict, BlockedError> {
    let Some(record) = record else {
        return Ok(Verdict::SAFE);
    };

    let path = path.filter(|p| !p.is_empty());
    let mut is_safe = record.safe.unwrap_or(true);

    let Some(path_record) = path.and_then(|p| record.paths.get(p)) else {
        return finish(is_safe, path);
    };
    is_safe = path_record.safe.unwrap_or(is_safe);

    if query.is_empty() || !path.is_some_and(evaluates_query_params) {
        return finish(is_safe, path);
    }

    for (key, value) in query {
        let mut pair_safe = is_safe;
        for entry in path_record
            .query_params
            .iter()
            .filter(|entry| entry.matches(key, value))
        {
            pair_safe = entry.safe.unwrap_or(pair_safe);
            if !pair_safe {
                return Err(BlockedError::new(path));
            }
        }

        if !pair_safe {
            return Err(BlockedError::new(path));
        }
    }

    Ok(Verdict::SAFE)
}

/// Query entries are only consulted for paths that begin with `/` or a space.
pub fn evaluates_query_params(path: &str) -> bool {
    path.starts_with(['/', ' '])
}

fn finish(is_safe: bool, path: Option<&str>) -> Result<Verdict, BlockedError> {
    if is_safe {
        Ok(Verdict::SAFE)
    } else {
        Err(BlockedError::new(path))
    }
}
