use serde::Deserialize;
use std::time::Duration;

/// Deserializes a `{ unit = "...", value = N }` table into a [`Duration`].
pub fn duration_from_toml<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Helper {
        unit: String,
        value: u64,
    }

    let helper = Helper::deserialize(deserializer)?;
    match helper.unit.as_str() {
        "hours" | "hour" | "h" => Ok(Duration::from_secs(helper.value * 3600)),
        "minutes" | "mins" | "m" => Ok(Duration::from_secs(helper.value * 60)),
        "seconds" | "secs" | "s" => Ok(Duration::from_secs(helper.value)),
        "milliseconds" | "millis" | "ms" => Ok(Duration::from_millis(helper.value)),
        unit => Err(serde::de::Error::custom(format!(
            "Unsupported duration unit: {unit}"
        ))),
    }
}
