/// 格式化字节数
///
/// Whole bytes below 1 KB, two decimals above.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const UNIT_SIZE: f64 = 1024.0;

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= UNIT_SIZE && unit_index < UNITS.len() - 1 {
        size /= UNIT_SIZE;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 进度百分比，`progress` 取值 0..=1
pub fn format_percent(progress: f64) -> String {
    format!("{:.1}%", progress.clamp(0.0, 1.0) * 100.0)
}
