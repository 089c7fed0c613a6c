use anyhow::{Context, Result};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_seconds() -> Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before unix epoch")?;
    Ok(elapsed.as_secs() as i64)
}
