/// Runs a `Result<_, SyncError>` future, retrying it once after `$backoff` when
/// the first error is transient. Evaluates to `(result, retries)`.
macro_rules! retry_transient_operation {
    ($context:expr, $backoff:expr, $operation:expr) => {{
        const MAX_ATTEMPTS: u32 = 2;

        let context_value: String = $context.into();
        let backoff: std::time::Duration = $backoff;
        let mut attempt = 1;

        loop {
            match ($operation).await {
                Ok(value) => break (Ok(value), attempt - 1),
                Err(err) if attempt >= MAX_ATTEMPTS || !err.is_transient() => {
                    break (Err(err), attempt - 1)
                }
                Err(err) => {
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {}ms.",
                        attempt,
                        MAX_ATTEMPTS,
                        context_value,
                        err,
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_transient_operation;
