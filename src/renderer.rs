//! # ASCII Profile Rendering
//!
//! Terminal plot of a profile for the `query --plot` command: depth grows
//! downwards, sound speed to the right. Processed samples are drawn as `•`,
//! samples that survive thinning into the device view as `◆`.

use crate::Profile;

const ROWS: usize = 24;
const COLUMNS: usize = 60;
/// Space for depth labels plus the axis line
const Y_AXIS_WIDTH: usize = 8;

/// (min, max) of `values`, widened when flat so scaling never divides by
/// zero.
fn bounds(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), v| {
        (min.min(v), max.max(v))
    });
    if !min.is_finite() || !max.is_finite() {
        return None;
    }
    if max - min < 1e-6 {
        Some((min - 0.5, max + 0.5))
    } else {
        Some((min, max))
    }
}

/// Render `profile` as lines of text. Returns a single explanatory line when
/// there is nothing to draw.
pub fn render_ascii(profile: &Profile) -> Vec<String> {
    let points: Vec<(f64, f64)> = profile.processed.depth_speed_pairs();
    let device: Vec<(f64, f64)> = profile
        .device
        .depth_speed_pairs()
        .into_iter()
        .filter(|(depth, _)| profile.processed.depth_range().is_some_and(|(_, max)| *depth <= max))
        .collect();

    let (Some((min_depth, max_depth)), Some((min_speed, max_speed))) = (
        bounds(points.iter().map(|p| p.0)),
        bounds(points.iter().map(|p| p.1)),
    ) else {
        return vec!["(no valid samples)".to_string()];
    };

    let depth_to_row = |depth: f64| {
        let normalized = (depth - min_depth) / (max_depth - min_depth);
        ((normalized * (ROWS as f64 - 1.0)).round() as usize).min(ROWS - 1)
    };
    let speed_to_column = |speed: f64| {
        let normalized = (speed - min_speed) / (max_speed - min_speed);
        ((normalized * (COLUMNS as f64 - 1.0)).round() as usize).min(COLUMNS - 1)
    };

    let mut grid = vec![vec![' '; COLUMNS + Y_AXIS_WIDTH]; ROWS];
    for (row, line) in grid.iter_mut().enumerate() {
        line[Y_AXIS_WIDTH - 1] = '│';
        // Depth labels every sixth row and on the last one
        if row % 6 == 0 || row == ROWS - 1 {
            let depth = min_depth + (max_depth - min_depth) * row as f64 / (ROWS as f64 - 1.0);
            let label = format!("{:>width$.0}", depth, width = Y_AXIS_WIDTH - 2);
            for (i, ch) in label.chars().take(Y_AXIS_WIDTH - 2).enumerate() {
                line[i] = ch;
            }
        }
    }

    for &(depth, speed) in &points {
        grid[depth_to_row(depth)][Y_AXIS_WIDTH + speed_to_column(speed)] = '•';
    }
    for &(depth, speed) in &device {
        if (min_speed..=max_speed).contains(&speed) {
            grid[depth_to_row(depth)][Y_AXIS_WIDTH + speed_to_column(speed)] = '◆';
        }
    }

    let mut lines = Vec::with_capacity(ROWS + 3);
    if let (Some(position), Some(time)) = (profile.meta.position, profile.meta.timestamp) {
        lines.push(format!(
            "{:.4}, {:.4}  {}",
            position.latitude,
            position.longitude,
            time.format("%Y-%m-%d %H:%M UTC")
        ));
    }
    lines.extend(grid.into_iter().map(|row| row.into_iter().collect::<String>().trim_end().to_string()));

    let padding = " ".repeat(Y_AXIS_WIDTH);
    lines.push(format!("{}{}", padding, "─".repeat(COLUMNS)));
    let left = format!("{:.1}", min_speed);
    let right = format!("{:.1} m/s", max_speed);
    let gap = COLUMNS.saturating_sub(left.len() + right.len()).max(1);
    lines.push(format!("{}{}{}{}", padding, left, " ".repeat(gap), right));
    lines
}

/// Print the plot of `profile` to stdout.
pub fn draw_ascii(profile: &Profile) {
    for line in render_ascii(profile) {
        println!("{}", line);
    }
}
