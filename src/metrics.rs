use crate::dispatch::DispatchReport;

#[allow(clippy::module_name_repetitions)] // For conistency with other modules.
pub fn register_metrics() {
    // Descriptions of labeled metrics
    metrics::describe_gauge!(
        "unibot_source_access_success",
        "1 if the last fetch of the source was successful, 0 otherwise."
    );
    metrics::describe_gauge!(
        "unibot_source_last_access_timestamp_seconds",
        "UNIX timestamp of the last fetch of the source."
    );
    metrics::describe_counter!(
        "unibot_announcements_total",
        "Number of new announcements stored."
    );
    metrics::describe_counter!(
        "unibot_notifications_total",
        "Number of users notified, by outcome."
    );
    metrics::describe_counter!("unibot_cycles_total", "Number of cycles run.");
    metrics::describe_gauge!("unibot_users", "Number of registered users.");

    // Constant metrics

    // unibot_start_time_seconds
    metrics::describe_gauge!(
        "unibot_start_time_seconds",
        "Unix timestamp of the bot start time."
    );
    metrics::gauge!(
        "unibot_start_time_seconds",
        std::time::UNIX_EPOCH.elapsed().unwrap_or_default().as_secs_f64(),
    );

    // unibot_build_info
    metrics::describe_gauge!(
        "unibot_build_info",
        "A metric with a constant '1' value with the unibot build information."
    );
    metrics::gauge!(
        "unibot_build_info",
        1.0,
        "revision" => crate::version(),
    );
}

pub fn update_source(website: &str, success: bool) {
    metrics::gauge!(
        "unibot_source_access_success",
        if success { 1.0 } else { 0.0 },
        "website" => website.to_string(),
    );
    metrics::gauge!(
        "unibot_source_last_access_timestamp_seconds",
        std::time::UNIX_EPOCH.elapsed().unwrap_or_default().as_secs_f64(),
        "website" => website.to_string(),
        "status" => if success { "success" } else { "failure" },
    );
}

/// Record the outcome of one notification cycle.
#[allow(clippy::cast_precision_loss)] // Rounding errors are fine here.
pub fn record_cycle(new_announcements: usize, users: usize, report: &DispatchReport) {
    metrics::increment_counter!("unibot_cycles_total");
    metrics::counter!("unibot_announcements_total", new_announcements as u64);
    metrics::gauge!("unibot_users", users as f64);
    metrics::counter!(
        "unibot_notifications_total",
        report.delivered.len() as u64,
        "outcome" => "delivered",
    );
    metrics::counter!(
        "unibot_notifications_total",
        report.failures.len() as u64,
        "outcome" => "failed",
    );
}
