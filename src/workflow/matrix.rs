//! Expansion of a job's `strategy.matrix` into explicit job configurations,
//! with the display names the CI provider would have assigned.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{ReproduceError, Result};

// Matches ${{ matrix.(name) }}; group 1 is the matrix variable name.
static MATRIX_INTERPOLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\{\s*matrix\.([^\s}]+)\s*\}\}").unwrap());

/// One expanded job: the API-visible display name, the job's base name, its
/// id in the workflow file, and the config with the matrix collapsed to a
/// single combination.
#[derive(Debug, Clone)]
pub struct ExpandedJob {
    pub api_name: String,
    pub base_name: String,
    pub workflow_id: String,
    pub config: Value,
}

/// Recursively lowercase all string keys.
fn lowercase_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(lowercase_keys).collect()),
        other => other.clone(),
    }
}

/// True when every key `d1` defines agrees with `d2`. Keys absent from `d2`
/// do not disqualify the match.
fn partial_match(d1: &Value, d2: &Value) -> bool {
    let (Value::Object(m1), Value::Object(m2)) = (d1, d2) else {
        return d1 == d2;
    };
    for (key, val) in m1 {
        if let Some(other) = m2.get(key) {
            if !partial_match(val, other) {
                return false;
            }
        }
    }
    true
}

/// Generate all combinations of a job matrix, applying `exclude` entries
/// (removed by partial match) and `include` entries (merged into each
/// matching combination, or appended when nothing matches).
pub fn build_combinations(job_matrix: &Value) -> Vec<Map<String, Value>> {
    let job_matrix = lowercase_keys(job_matrix);
    let Value::Object(matrix) = &job_matrix else {
        return Vec::new();
    };

    let includes: Vec<Value> = matrix
        .get("include")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let excludes: Vec<Value> = matrix
        .get("exclude")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let dimensions: Vec<(&String, &Vec<Value>)> = matrix
        .iter()
        .filter(|(k, _)| *k != "include" && *k != "exclude")
        .filter_map(|(k, v)| v.as_array().map(|arr| (k, arr)))
        .collect();

    let mut combinations: Vec<Map<String, Value>> = if dimensions.is_empty() {
        Vec::new()
    } else {
        let mut combos = vec![Map::new()];
        for (key, values) in &dimensions {
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for combo in &combos {
                for value in *values {
                    let mut expanded = combo.clone();
                    expanded.insert((*key).clone(), value.clone());
                    next.push(expanded);
                }
            }
            combos = next;
        }
        combos
    };

    combinations.retain(|combo| {
        let combo_value = Value::Object(combo.clone());
        !excludes.iter().any(|ex| partial_match(ex, &combo_value))
    });

    let mut includes_used = vec![false; includes.len()];
    for combo in combinations.iter_mut() {
        let combo_value = Value::Object(combo.clone());
        for (i, include) in includes.iter().enumerate() {
            if partial_match(include, &combo_value) {
                if let Value::Object(include_map) = include {
                    for (k, v) in include_map {
                        combo.insert(k.clone(), v.clone());
                    }
                }
                includes_used[i] = true;
            }
        }
    }

    for (i, used) in includes_used.iter().enumerate() {
        if !used {
            if let Value::Object(include_map) = &includes[i] {
                combinations.push(include_map.clone());
            }
        }
    }

    combinations
}

/// Yield the dotted path of every leaf in a nested object.
fn flatten_dict_keys(value: &Value, prefix: Option<&str>, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let next = match prefix {
                    Some(p) => format!("{p}.{k}"),
                    None => k.clone(),
                };
                flatten_dict_keys(v, Some(&next), out);
            }
        }
        _ => {
            if let Some(p) = prefix {
                out.push(p.to_string());
            }
        }
    }
}

/// Flatten nested arrays/objects into their scalar display forms.
fn flatten_elements(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten_elements(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                flatten_elements(item, out);
            }
        }
        Value::Bool(b) => out.push(b.to_string()),
        Value::String(s) => out.push(s.clone()),
        Value::Null => out.push(String::new()),
        other => out.push(other.to_string()),
    }
}

fn is_empty_value(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.is_empty())
}

/// Compute the job's API display name by interpolating matrix variables.
///
/// A name template without interpolations defaults to the base name followed
/// by the combination's values in parentheses, base-dimension order first.
pub fn get_job_api_name(
    base_name: &str,
    combination: &Map<String, Value>,
    default_keys: &[String],
    job_matrix: &Value,
) -> String {
    let mut interpolations = Vec::new();
    for key in default_keys {
        if let Some(value) = combination.get(key) {
            if !is_empty_value(value) {
                let mut flattened = Vec::new();
                flatten_dict_keys(value, Some(key), &mut flattened);
                for flattened_key in flattened {
                    interpolations.push(format!("${{{{ matrix.{flattened_key} }}}}"));
                }
            }
        }
    }

    // Include-introduced values outside the base dimensions join the name
    // only when the combination itself is include-only.
    let mut add_non_defaults_key = false;
    for (key, val) in combination {
        if default_keys.contains(key) {
            let in_base = job_matrix
                .get(key)
                .and_then(|v| v.as_array())
                .is_some_and(|arr| arr.contains(val));
            if !in_base {
                add_non_defaults_key = true;
            }
        } else if add_non_defaults_key && !is_empty_value(val) {
            let mut flattened = Vec::new();
            flatten_dict_keys(val, Some(key), &mut flattened);
            for flattened_key in flattened {
                interpolations.push(format!("${{{{ matrix.{flattened_key} }}}}"));
            }
        }
    }

    let intermediate_name = if !interpolations.is_empty() && !MATRIX_INTERPOLATE.is_match(base_name)
    {
        format!("{} ({})", base_name, interpolations.join(", "))
    } else {
        base_name.to_string()
    };

    // Interpolate every ${{ matrix.* }} reference, resolving dotted paths
    // into nested objects.
    let mut job_name = String::new();
    let mut idx = 0;
    for caps in MATRIX_INTERPOLATE.captures_iter(&intermediate_name) {
        let whole = caps.get(0).unwrap();
        job_name.push_str(&intermediate_name[idx..whole.start()]);
        idx = whole.end();

        let mut value: Option<&Value> = None;
        for (i, key) in caps[1].split('.').enumerate() {
            let key = key.to_lowercase();
            value = if i == 0 {
                combination.get(&key)
            } else {
                value.and_then(|v| v.get(&key))
            };
            if value.is_none() {
                break;
            }
        }

        let mut value_list = Vec::new();
        if let Some(value) = value {
            flatten_elements(value, &mut value_list);
        }
        job_name.push_str(&value_list.join(", "));
    }
    job_name.push_str(&intermediate_name[idx..]);
    let mut job_name = job_name.trim().to_string();

    // Names over 100 characters are truncated, even in the API.
    if job_name.chars().count() > 100 {
        job_name = job_name.chars().take(97).collect::<String>() + "...";
    }

    job_name
}

/// Expand every job in a workflow's `jobs` mapping into all combinations of
/// its matrix. Groups are returned per job, longest group first, so callers
/// can match expanded names against API job sequences greedily.
pub fn expand_job_matrixes(jobs: &Value) -> Result<Vec<Vec<ExpandedJob>>> {
    let Value::Object(jobs_map) = jobs else {
        return Err(ReproduceError::InvalidInput(
            "workflow 'jobs' is not a mapping".to_string(),
        ));
    };

    let mut groups: Vec<Vec<ExpandedJob>> = Vec::new();
    let mut disambiguated: Vec<(String, Option<Value>)> = Vec::new();

    for (workflow_id, job) in jobs_map {
        let base_name = job
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or(workflow_id)
            .to_string();

        let matrix = job.get("strategy").and_then(|s| s.get("matrix"));

        if let Some(matrix) = matrix {
            // A string matrix depends on another job's output; it cannot be
            // expanded statically.
            if matrix.is_string() {
                log::warn!("Job matrix probably depends on another job's output. Skipping.");
                continue;
            }

            let key = (base_name.clone(), Some(matrix.clone()));
            if disambiguated.contains(&key) {
                return Err(ReproduceError::UnsupportedWorkflow(
                    "two jobs with the same name and matrix cannot be disambiguated".to_string(),
                ));
            }
            disambiguated.push(key);

            let lowercased_matrix = lowercase_keys(matrix);
            let mut default_keys: Vec<String> = lowercased_matrix
                .as_object()
                .map(|m| {
                    m.keys()
                        .filter(|k| *k != "include" && *k != "exclude")
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            // A matrix of only include rules takes its name keys from each
            // combination instead.
            let default_keys_are_dynamic =
                default_keys.is_empty() && lowercased_matrix.get("include").is_some();

            let mut group = Vec::new();
            for combination in build_combinations(matrix) {
                if default_keys_are_dynamic {
                    default_keys = combination.keys().cloned().collect();
                }

                let mut config = job.clone();
                config["strategy"]["matrix"] = Value::Object(combination.clone());
                let api_name =
                    get_job_api_name(&base_name, &combination, &default_keys, &lowercased_matrix);
                group.push(ExpandedJob {
                    api_name,
                    base_name: base_name.clone(),
                    workflow_id: workflow_id.clone(),
                    config,
                });
            }
            groups.push(group);
        } else {
            let key = (base_name.clone(), None);
            if disambiguated.contains(&key) {
                return Err(ReproduceError::UnsupportedWorkflow(
                    "two jobs with the same name cannot be disambiguated".to_string(),
                ));
            }
            disambiguated.push(key);

            let api_name = get_job_api_name(&base_name, &Map::new(), &[], &Value::Null);
            groups.push(vec![ExpandedJob {
                api_name,
                base_name: base_name.clone(),
                workflow_id: workflow_id.clone(),
                config: job.clone(),
            }]);
        }
    }

    groups.sort_by_key(|group| std::cmp::Reverse(group.len()));
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cartesian_product_order() {
        let matrix = json!({"foo": [1, 2], "bar": [3, 4]});
        let combos = build_combinations(&matrix);
        let rendered: Vec<String> = combos
            .iter()
            .map(|c| format!("{}-{}", c["foo"], c["bar"]))
            .collect();
        assert_eq!(rendered, vec!["1-3", "1-4", "2-3", "2-4"]);
    }

    #[test]
    fn test_exclude_removes_partial_matches() {
        let matrix = json!({"foo": [1, 2], "bar": [3, 4], "exclude": [{"foo": 1}]});
        let combos = build_combinations(&matrix);
        assert_eq!(combos.len(), 2);
        assert!(combos.iter().all(|c| c["foo"] == json!(2)));
    }

    #[test]
    fn test_include_merge_and_append() {
        // The ordered-tuple scenario: merged include first, then the
        // untouched base products, then unmatched includes in input order.
        let matrix = json!({
            "foo": [1, 2],
            "bar": [3, 4],
            "include": [{"foo": 1, "bar": 5}, {"foo": 6, "bar": 7}, {"foo": 1, "bar": 3, "baz": 11}],
            "exclude": []
        });
        let combos = build_combinations(&matrix);
        let rendered: Vec<String> = combos
            .iter()
            .map(|c| {
                let baz = c
                    .get("baz")
                    .map(|b| format!(",baz={b}"))
                    .unwrap_or_default();
                format!("({},{}{})", c["foo"], c["bar"], baz)
            })
            .collect();
        assert_eq!(
            rendered,
            vec!["(1,3,baz=11)", "(1,4)", "(2,3)", "(2,4)", "(1,5)", "(6,7)"]
        );
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let matrix = json!({"foo": [1, 2], "bar": [3, 4], "include": [{"foo": 1, "bar": 5}]});
        let a = build_combinations(&matrix);
        let b = build_combinations(&matrix);
        assert_eq!(a, b);
    }

    #[test]
    fn test_job_api_names() {
        let jobs = json!({
            "job1": {
                "strategy": {"matrix": {
                    "foo": [1, 2],
                    "bar": [3, 4],
                    "include": [{"foo": 1, "bar": 5}, {"foo": 6, "bar": 7}, {"foo": 1, "bar": 3, "baz": 11}]
                }},
                "steps": []
            }
        });
        let groups = expand_job_matrixes(&jobs).unwrap();
        assert_eq!(groups.len(), 1);
        let names: Vec<&str> = groups[0].iter().map(|j| j.api_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "job1 (1, 3)",
                "job1 (1, 4)",
                "job1 (2, 3)",
                "job1 (2, 4)",
                "job1 (1, 5)",
                "job1 (6, 7)"
            ]
        );
    }

    #[test]
    fn test_name_template_interpolation() {
        let jobs = json!({
            "build": {
                "name": "Build on ${{ matrix.os }}",
                "strategy": {"matrix": {"os": ["ubuntu-20.04", "ubuntu-22.04"]}},
                "steps": []
            }
        });
        let groups = expand_job_matrixes(&jobs).unwrap();
        let names: Vec<&str> = groups[0].iter().map(|j| j.api_name.as_str()).collect();
        assert_eq!(names, vec!["Build on ubuntu-20.04", "Build on ubuntu-22.04"]);
    }

    #[test]
    fn test_job_without_matrix() {
        let jobs = json!({"lint": {"steps": []}});
        let groups = expand_job_matrixes(&jobs).unwrap();
        assert_eq!(groups[0][0].api_name, "lint");
        assert_eq!(groups[0][0].workflow_id, "lint");
    }

    #[test]
    fn test_duplicate_jobs_are_rejected() {
        let jobs = json!({
            "a": {"name": "same", "steps": []},
            "b": {"name": "same", "steps": []}
        });
        assert!(expand_job_matrixes(&jobs).is_err());
    }

    #[test]
    fn test_groups_sorted_longest_first() {
        let jobs = json!({
            "single": {"steps": []},
            "matrixed": {"strategy": {"matrix": {"v": [1, 2, 3]}}, "steps": []}
        });
        let groups = expand_job_matrixes(&jobs).unwrap();
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[1].len(), 1);
    }

    #[test]
    fn test_config_carries_collapsed_matrix() {
        let jobs = json!({
            "job1": {"strategy": {"matrix": {"v": [1, 2]}}, "steps": []}
        });
        let groups = expand_job_matrixes(&jobs).unwrap();
        assert_eq!(groups[0][0].config["strategy"]["matrix"]["v"], json!(1));
        assert_eq!(groups[0][1].config["strategy"]["matrix"]["v"], json!(2));
    }

    #[test]
    fn test_name_truncation_at_100_chars() {
        let long = "x".repeat(150);
        let jobs = json!({ "j": {"name": long, "steps": []} });
        let groups = expand_job_matrixes(&jobs).unwrap();
        assert_eq!(groups[0][0].api_name.chars().count(), 100);
        assert!(groups[0][0].api_name.ends_with("..."));
    }
}
