//! Fixed, versioned prompt templates with `{{placeholder}}` substitution.
//!
//! Plain string replacement, matching the materialization code's existing
//! style -- no templating engine dependency.

use std::collections::HashMap;

/// Current prompt template format version, embedded in every prompt so that
/// changes to wording can be correlated with agent behavior over time.
pub const PROMPT_VERSION: &str = "gator-prompt-v1";

const CODING_TEMPLATE: &str = "\
<!-- {{version}} -->
# Task: {{task_name}}

{{description}}

{{previous_feedback}}
## Dependencies

{{dependencies}}

## Instructions

Work in the repository at `{{repo_path}}` on branch `{{branch}}`. When you are
done, write a result file to `{{result_path}}` with:

```json
{\"status\": \"success\" | \"failed\", \"summary\": \"...\", \"open_questions\": [{\"id\": \"...\", \"text\": \"...\"}]}
```

Do not push. The core will run the project's tests and invariant checks
after you finish.
";

const REVIEW_TEMPLATE: &str = "\
<!-- {{version}} -->
# Review: {{task_name}}

{{description}}

Read `context/implementation.diff` in this directory for the change under
review -- do not invoke Git yourself.

## Instructions

Write a result file to `{{result_path}}` with:

```json
{\"status\": \"approved\" | \"rejected\", \"summary\": \"...\", \"issues\": [\"...\"], \"notes\": \"...\"}
```
";

const MERGER_TEMPLATE: &str = "\
<!-- {{version}} -->
# Resolve merge conflict: {{task_name}}

The branch `{{branch}}` conflicts with `{{base_branch}}` on the following files:

{{conflict_files}}

## Conflict diff (truncated)

```diff
{{conflict_diff}}
```

## Recently merged tasks

{{recent_merges}}

## Instructions

Resolve the conflict in the repository's main working tree at
`{{repo_path}}`. Do not push. When finished, write a result file to
`{{result_path}}` with:

```json
{\"status\": \"success\" | \"failed\", \"summary\": \"...\"}
```
";

/// Substitute `{{key}}` placeholders in `template` from `vars`. Any
/// placeholder with no matching key is replaced with an empty string.
fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    // Sweep any remaining unknown placeholders.
    while let Some(start) = out.find("{{") {
        let Some(end) = out[start..].find("}}") else {
            break;
        };
        out.replace_range(start..start + end + 2, "");
    }
    out
}

/// Render the coding-phase prompt.
pub fn render_coding(vars: &HashMap<&str, String>) -> String {
    let mut vars = vars.clone();
    vars.entry("version").or_insert_with(|| PROMPT_VERSION.to_string());
    render(CODING_TEMPLATE, &vars)
}

/// Render the review-phase prompt.
pub fn render_review(vars: &HashMap<&str, String>) -> String {
    let mut vars = vars.clone();
    vars.entry("version").or_insert_with(|| PROMPT_VERSION.to_string());
    render(REVIEW_TEMPLATE, &vars)
}

/// Render the merger-phase prompt.
pub fn render_merger(vars: &HashMap<&str, String>) -> String {
    let mut vars = vars.clone();
    vars.entry("version").or_insert_with(|| PROMPT_VERSION.to_string());
    render(MERGER_TEMPLATE, &vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_coding_substitutes_placeholders() {
        let mut vars = HashMap::new();
        vars.insert("task_name", "implement-jwt".to_string());
        vars.insert("description", "Add JWT middleware.".to_string());
        vars.insert("previous_feedback", String::new());
        vars.insert("dependencies", "- auth-scaffold: passed\n".to_string());
        vars.insert("repo_path", "/repo".to_string());
        vars.insert("branch", "gator/plan/implement-jwt".to_string());
        vars.insert("result_path", "/repo/.gator/active/x/result.json".to_string());

        let out = render_coding(&vars);
        assert!(out.contains("implement-jwt"));
        assert!(out.contains("Add JWT middleware."));
        assert!(out.contains(PROMPT_VERSION));
        assert!(!out.contains("{{"));
    }

    #[test]
    fn render_leaves_no_unknown_placeholders() {
        let vars = HashMap::new();
        let out = render_review(&vars);
        assert!(!out.contains("{{"));
        assert!(!out.contains("}}"));
    }
}
