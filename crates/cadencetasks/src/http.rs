use cadencecore::TaskError;

const USER_AGENT: &str = concat!("cadence/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client a task holds for the duration of a step
pub(crate) fn build_client() -> Result<reqwest::Client, TaskError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| TaskError::Infrastructure(format!("failed to build HTTP client: {}", e)))
}

/// GET a JSON document. Transport errors and non-success statuses fail the
/// attempt so the retry policy applies.
pub(crate) async fn get_json(
    client: &reqwest::Client,
    url: &str,
) -> Result<serde_json::Value, TaskError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| TaskError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(TaskError::ExecutionFailed(format!(
            "GET {} returned {}",
            url, status
        )));
    }

    response
        .json()
        .await
        .map_err(|e| TaskError::ExecutionFailed(format!("Failed to read response: {}", e)))
}

pub(crate) fn not_initialized(task: &str) -> TaskError {
    TaskError::Infrastructure(format!("{} was run before initialize", task))
}
