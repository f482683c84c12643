use std::path::Path;

use prwatch_core::classify::AgentCategory;
use prwatch_core::remediation::FailureContext;

/// Category-specific opening instruction.
pub fn category_template(category: AgentCategory) -> &'static str {
    match category {
        AgentCategory::E2e => {
            "An end-to-end test run failed. Reproduce the failing scenario locally if a \
             runner is available, find whether the product or the test is wrong, and fix \
             the root cause. Do not mark tests as skipped."
        }
        AgentCategory::Lint => {
            "A lint check failed. Run the project's linter, fix every reported issue in \
             the changed code, and do not disable rules."
        }
        AgentCategory::Type => {
            "A type check failed. Run the type checker, fix the reported errors with \
             correct types, and avoid escape hatches such as `any` or casts."
        }
        AgentCategory::Build => {
            "The build failed. Reproduce the build locally, fix compilation or bundling \
             errors, and keep dependency changes to the minimum needed."
        }
        AgentCategory::Integration => {
            "An integration test run failed. Identify which service boundary broke, \
             check for contract or configuration drift, and fix the code under test."
        }
        AgentCategory::Test => {
            "A test run failed. Run the failing tests, determine whether the code or the \
             test expectation is wrong, and fix the root cause."
        }
        AgentCategory::Api => {
            "An API or compatibility check failed. Find the breaking change in the public \
             interface and restore compatibility, or update the contract if the change \
             is intended."
        }
        AgentCategory::General => {
            "A CI run failed. Read the failure details below, reproduce locally where \
             possible, and fix the cause."
        }
    }
}

/// Compose the prompt sent to the remediation agent.
///
/// Layout: optional project prompt, category instruction, failure summary with
/// links, then the diff of the change request.
pub fn build_prompt(ctx: &FailureContext, workdir: &Path) -> String {
    let mut s = String::new();

    if let Some(repo_prompt) = read_repo_prompt(workdir) {
        s.push_str("## Project Context\n\n");
        s.push_str(&repo_prompt);
        s.push_str("\n\n---\n\n");
    }

    s.push_str(category_template(ctx.category));
    s.push_str("\n\n");

    s.push_str(&format!(
        "Pull request: {}\nRevision: {}\nFailed run: {} ({})\nCategory: {}\n\n",
        ctx.change_request, ctx.head_sha, ctx.run_name, ctx.run_url, ctx.category
    ));

    s.push_str("## Failure summary\n\n");
    s.push_str(&ctx.analysis);
    s.push('\n');
    for job in &ctx.jobs {
        s.push_str(&format!("\n- {}: {}", job.job_name, job.url));
    }

    if !ctx.diff.is_empty() {
        s.push_str("\n\n## Pull request diff\n\n```diff\n");
        s.push_str(&ctx.diff);
        if !ctx.diff.ends_with('\n') {
            s.push('\n');
        }
        s.push_str("```\n");
    }

    s.push_str(
        "\nWhen the fix is ready, commit it on the current branch with a message \
         starting with \"fix:\". Do not push.\n",
    );
    s
}

/// `.prwatch/prompt.md` in the checkout, if present and non-empty.
fn read_repo_prompt(workdir: &Path) -> Option<String> {
    let content = std::fs::read_to_string(workdir.join(".prwatch/prompt.md")).ok()?;
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
