use ratatui::{
    prelude::*,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{
        canvas::{Canvas, Circle},
        BarChart, Block, BorderType, Borders, Gauge, List, ListItem, Paragraph, Sparkline, Tabs,
        Wrap,
    },
};

use crate::interface::state::{AppMode, AppState, Snapshot, WorkerStatus};

// --- Color Palette ---
const COL_BG: Color = Color::Reset;
const COL_FG: Color = Color::White;
const COL_HIGHLIGHT: Color = Color::Yellow;
const COL_ACCENT: Color = Color::Cyan;
const COL_CONFIDENT: Color = Color::LightBlue;
const COL_UNCERTAIN: Color = Color::Yellow;
const COL_QUERY: Color = Color::LightRed;
const COL_SUCCESS: Color = Color::Green;
const COL_FAIL: Color = Color::Red;
const COL_MAE: Color = Color::LightGreen;

pub fn draw(f: &mut Frame, app: &mut AppState) {
    if f.area().width < 40 || f.area().height < 10 {
        let p = Paragraph::new("Terminal too small.")
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(p, f.area());
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(f.area());

    draw_header(f, app, chunks[0]);

    match app.mode {
        AppMode::Dashboard => draw_dashboard(f, app, chunks[1]),
        AppMode::Analysis => draw_analysis(f, app, chunks[1]),
        AppMode::StructureViewer => draw_fullscreen_viewer(f, app, chunks[1]),
        AppMode::Help => draw_help(f, chunks[1]),
    }

    draw_footer(f, app, chunks[2]);
}

fn draw_header(f: &mut Frame, app: &AppState, area: Rect) {
    let titles = vec![" 1:Dash ", " 2:Analysis ", " 3:Viewer ", " ?:Help "];
    let idx = match app.mode {
        AppMode::Dashboard => 0,
        AppMode::Analysis => 1,
        AppMode::StructureViewer => 2,
        AppMode::Help => 3,
    };

    let tabs = Tabs::new(titles)
        .block(Block::default().borders(Borders::BOTTOM))
        .select(idx)
        .highlight_style(Style::default().fg(COL_HIGHLIGHT).add_modifier(Modifier::BOLD));

    f.render_widget(tabs, area);
}

fn draw_footer(f: &mut Frame, app: &AppState, area: Rect) {
    let status_str = match app.worker_status {
        WorkerStatus::Running => "RUNNING",
        WorkerStatus::Paused => "PAUSED",
        WorkerStatus::Idle => "IDLE",
        WorkerStatus::Starting => "STARTING",
        WorkerStatus::Finished => "DONE",
        WorkerStatus::Error => "ERROR",
    };

    let color = match app.worker_status {
        WorkerStatus::Running => COL_SUCCESS,
        WorkerStatus::Error => COL_FAIL,
        WorkerStatus::Paused => COL_HIGHLIGHT,
        _ => COL_FG,
    };

    let text = Line::from(vec![
        Span::styled(
            format!(" STATUS: {:<8}", status_str),
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        ),
        Span::raw(" | "),
        Span::raw(format!("Steps/s: {:<6.1}", app.steps_per_second)),
        Span::raw(" | "),
        Span::styled(format!("Oracle calls: {}", app.dft_calls), Style::default().fg(COL_ACCENT)),
        Span::raw(" | [Q]uit [Space]Pause [A]uto-rot [R]eset-View"),
    ]);

    let p = Paragraph::new(text).style(Style::default().bg(Color::DarkGray).fg(Color::White));
    f.render_widget(p, area);
}

fn draw_dashboard(f: &mut Frame, app: &AppState, area: Rect) {
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(area);

    let left_rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(cols[0]);

    match &app.snapshot {
        Some(snapshot) => draw_structure(f, app, left_rows[0], snapshot, " Live Structure "),
        None => f.render_widget(
            Block::default().title(" Waiting for Data... ").borders(Borders::ALL),
            left_rows[0],
        ),
    }

    draw_learning_charts(f, app, left_rows[1]);

    let right_rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(50),
            Constraint::Percentage(20),
            Constraint::Percentage(30),
        ])
        .split(cols[1]);

    draw_logs(f, app, right_rows[0]);
    draw_gauges(f, app, right_rows[1]);
    draw_stats(f, app, right_rows[2]);
}

fn score_color(score: f64, app: &AppState) -> Color {
    if !(score <= app.params.call_threshold) {
        COL_QUERY
    } else if score > app.params.add_threshold {
        COL_UNCERTAIN
    } else {
        COL_CONFIDENT
    }
}

fn draw_structure(f: &mut Frame, app: &AppState, area: Rect, snapshot: &Snapshot, title: &str) {
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded);

    let inner_area = block.inner(area);
    f.render_widget(block, area);

    if inner_area.width < 1 || inner_area.height < 1 {
        return;
    }
    let config = &snapshot.configuration;
    if config.is_empty() {
        return;
    }

    use nalgebra::{Point3, Rotation3, Vector3};
    let rot_y = Rotation3::from_axis_angle(&Vector3::y_axis(), app.viewport.azimuth);
    let rot_x = Rotation3::from_axis_angle(&Vector3::x_axis(), app.viewport.elevation);
    let center = config.lattice().to_cartesian(&Point3::new(0.5, 0.5, 0.5));

    let mut render_atoms: Vec<(f64, f64, f64, Color)> = config
        .positions()
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let r = rot_x * rot_y * (p - center);
            let score = snapshot.scores.get(i).copied().unwrap_or(0.0);
            (r.x, r.y, r.z, score_color(score, app))
        })
        .collect();

    if render_atoms.iter().any(|(x, y, z, _)| x.is_nan() || y.is_nan() || z.is_nan()) {
        f.render_widget(
            Paragraph::new("Error: NaN Coordinates").style(Style::default().fg(COL_FAIL)),
            inner_area,
        );
        return;
    }

    let bound = render_atoms
        .iter()
        .flat_map(|(x, y, _, _)| [x.abs(), y.abs()])
        .fold(0.0, f64::max)
        .max(1.0)
        * 1.2;

    // Far atoms first so near ones overdraw them.
    render_atoms.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

    let radius = (bound / 25.0).max(0.2);
    let canvas = Canvas::default()
        .background_color(COL_BG)
        .x_bounds([-bound, bound])
        .y_bounds([-bound, bound])
        .paint(|ctx| {
            for (x, y, z, col) in &render_atoms {
                let perspective = (1.0 + z / bound * 0.3).clamp(0.5, 1.5);
                let zoom = app.viewport.zoom;
                ctx.draw(&Circle {
                    x: *x * zoom,
                    y: *y * zoom,
                    radius: radius * zoom * perspective,
                    color: *col,
                });
            }
        });

    f.render_widget(canvas, inner_area);

    let rot_status = if app.viewport.auto_rotate { "Auto-Rot: ON" } else { "Auto-Rot: OFF" };
    let overlay = Paragraph::new(rot_status)
        .style(Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC));
    let overlay_area = Rect {
        x: inner_area.x + inner_area.width.saturating_sub(14),
        y: inner_area.y,
        width: 14.min(inner_area.width),
        height: 1,
    };
    f.render_widget(overlay, overlay_area);
}

/// Scales the trailing `width` samples of a history to sparkline bars.
fn spark_data(history: impl DoubleEndedIterator<Item = f64>, width: usize, upper: f64) -> Vec<u64> {
    let upper = if upper > 0.0 { upper } else { 1.0 };
    let mut data: Vec<u64> = history
        .rev()
        .take(width)
        .map(|v| ((v / upper).clamp(0.0, 1.0) * 100.0) as u64)
        .collect();
    data.reverse();
    data
}

fn draw_learning_charts(f: &mut Frame, app: &AppState, area: Rect) {
    let block = Block::default().title(" Learning Progress ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(inner);

    let width = inner.width as usize;
    let t = &app.telemetry;

    if !t.uncertainty_history.is_empty() {
        let upper = t.max_uncertainty_seen.max(app.params.call_threshold);
        let data = spark_data(t.uncertainty_history.iter().map(|(_, u)| *u), width, upper);
        let spark = Sparkline::default()
            .block(Block::default().title(format!(
                "Max uncertainty (call > {:.2e})",
                app.params.call_threshold
            )))
            .style(Style::default().fg(COL_ACCENT))
            .data(&data);
        f.render_widget(spark, chunks[0]);
    }

    if !t.force_mae_history.is_empty() {
        let upper = t.force_mae_history.iter().map(|(_, m)| *m).fold(0.0, f64::max);
        let data = spark_data(t.force_mae_history.iter().map(|(_, m)| *m), width, upper);
        let spark = Sparkline::default()
            .block(Block::default().title("Force MAE at oracle calls"))
            .style(Style::default().fg(COL_MAE))
            .data(&data);
        f.render_widget(spark, chunks[1]);
    }
}

fn draw_logs(f: &mut Frame, app: &AppState, area: Rect) {
    let block = Block::default().title(" Run Log ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let items: Vec<ListItem> = app
        .logs
        .iter()
        .rev()
        .map(|line| {
            let lower = line.to_lowercase();
            let style = if lower.contains("error") || lower.contains("failed") {
                Style::default().fg(COL_FAIL)
            } else if line.contains("Oracle call") {
                Style::default().fg(COL_SUCCESS)
            } else {
                Style::default().fg(Color::Gray)
            };

            ListItem::new(Line::from(vec![
                Span::styled(">", Style::default().fg(Color::DarkGray)),
                Span::raw(" "),
                Span::raw(line.as_str()),
            ]))
            .style(style)
        })
        .collect();

    f.render_widget(List::new(items), inner);
}

fn draw_gauges(f: &mut Frame, app: &AppState, area: Rect) {
    let block = Block::default().title(" Health ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1); 2])
        .split(inner);

    let rate = app.call_rate();
    let g_rate = Gauge::default()
        .gauge_style(Style::default().fg(COL_ACCENT).bg(Color::DarkGray))
        .ratio(rate.clamp(0.0, 1.0))
        .label(format!("Oracle call rate: {:.1}%", rate * 100.0));
    f.render_widget(g_rate, layout[0]);

    let latest = app
        .telemetry
        .latest
        .as_ref()
        .and_then(|m| m.max_uncertainty)
        .unwrap_or(0.0);
    let ratio = if app.params.call_threshold > 0.0 {
        latest / app.params.call_threshold
    } else {
        1.0
    };
    let color = if ratio > 1.0 { COL_QUERY } else { COL_SUCCESS };
    let g_unc = Gauge::default()
        .gauge_style(Style::default().fg(color).bg(Color::DarkGray))
        .ratio(ratio.clamp(0.0, 1.0))
        .label(format!("Uncertainty / threshold: {:.2}", ratio));
    f.render_widget(g_unc, layout[1]);
}

fn kv_line(k: &str, v: String, value_style: Style) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{:<14}", k), Style::default().fg(Color::Gray)),
        Span::styled(v, value_style),
    ])
}

fn draw_stats(f: &mut Frame, app: &AppState, area: Rect) {
    let block = Block::default().title(" Statistics ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let hl = Style::default().fg(COL_HIGHLIGHT);
    let latest = app.telemetry.latest.as_ref();
    let fmt_opt = |v: Option<f64>| v.map(|x| format!("{:.4}", x)).unwrap_or_else(|| "-".into());

    let mut text = vec![
        kv_line("MD step:", app.current_step.to_string(), hl),
        kv_line("Oracle calls:", app.dft_calls.to_string(), hl),
        kv_line("Force MAE:", fmt_opt(latest.and_then(|m| m.force_mae)), Style::default().fg(COL_MAE)),
        kv_line("Energy MAE:", fmt_opt(latest.and_then(|m| m.energy_mae)), Style::default().fg(COL_MAE)),
    ];
    if let Some(thermo) = latest.and_then(|m| m.thermo) {
        text.push(kv_line("Temperature:", format!("{:.1} K", thermo.temperature), hl));
    }
    if let Some(reason) = &app.failure {
        text.push(kv_line("Failure:", reason.clone(), Style::default().fg(COL_FAIL)));
    }

    f.render_widget(Paragraph::new(text).wrap(Wrap { trim: true }), inner);
}

fn draw_analysis(f: &mut Frame, app: &AppState, area: Rect) {
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(area);

    draw_histogram(f, app, cols[0]);
    draw_config(f, app, cols[1]);
}

fn draw_histogram(f: &mut Frame, app: &AppState, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Per-atom score histogram (latest step) ");

    let Some(metrics) = app.telemetry.latest.as_ref().filter(|m| !m.histogram.is_empty()) else {
        f.render_widget(
            Paragraph::new("No scores yet.")
                .alignment(Alignment::Center)
                .block(block),
            area,
        );
        return;
    };

    let bins = metrics.histogram.len();
    let width = 4.0 * app.params.call_threshold / bins as f64;
    let labels: Vec<String> = (0..bins).map(|i| format!("{:.0e}", i as f64 * width)).collect();
    let bars: Vec<(&str, u64)> = labels
        .iter()
        .zip(&metrics.histogram)
        .map(|(l, &c)| (l.as_str(), c as u64))
        .collect();

    let chart = BarChart::default()
        .block(block)
        .bar_width(3)
        .bar_gap(1)
        .bar_style(Style::default().fg(COL_ACCENT))
        .value_style(Style::default().fg(Color::Black).bg(COL_ACCENT))
        .data(bars.as_slice());
    f.render_widget(chart, area);
}

fn draw_config(f: &mut Frame, app: &AppState, area: Rect) {
    let block = Block::default().borders(Borders::ALL).title(" Learner Parameters ");
    let inner = block.inner(area);
    f.render_widget(block, area);

    let p = &app.params;

    let kv = |k: &str, v: String| -> ListItem {
        ListItem::new(Line::from(vec![
            Span::styled(format!("{:<18}", k), Style::default().fg(COL_ACCENT)),
            Span::raw(v),
        ]))
    };
    let flag = |b: bool| if b { "yes".to_string() } else { "no".to_string() };

    let mut items = vec![
        kv("Species:", app.species_symbols.join(" ")),
        kv("Call threshold:", format!("{:.3e}", p.call_threshold)),
        kv("Add threshold:", format!("{:.3e}", p.add_threshold)),
        kv("Initial envs:", p.initial_environments.to_string()),
        ListItem::new(Line::from(" ")),
        kv("Train energy:", flag(p.train_energy)),
        kv("Train forces:", flag(p.train_forces)),
        kv("Train stress:", flag(p.train_stress)),
        ListItem::new(Line::from(" ")),
        kv("Optimizer:", p.optimizer.method.to_string()),
        kv(
            "Optimize every:",
            p.optimize_every.map(|n| n.to_string()).unwrap_or_else(|| "never".into()),
        ),
        kv("Model file:", p.model_path.display().to_string()),
    ];

    if let Some(hyps) = app.telemetry.latest.as_ref().map(|m| &m.hyperparameters) {
        if !hyps.is_empty() {
            items.push(ListItem::new(Line::from(" ")));
            let joined = hyps.iter().map(|h| format!("{:.4}", h)).collect::<Vec<_>>().join(", ");
            items.push(kv("Hyperparameters:", joined));
        }
    }

    f.render_widget(List::new(items), inner);
}

fn draw_fullscreen_viewer(f: &mut Frame, app: &AppState, area: Rect) {
    match &app.snapshot {
        Some(snapshot) => draw_structure(f, app, area, snapshot, " Structure Viewer (Fullscreen) "),
        None => {
            let p = Paragraph::new("No structure received yet.")
                .alignment(Alignment::Center)
                .block(Block::default().borders(Borders::ALL));
            f.render_widget(p, area);
        }
    }
}

fn draw_help(f: &mut Frame, area: Rect) {
    let key = |k: &str, d: &str| {
        Line::from(vec![
            Span::styled(format!("{:<10}", k), Style::default().fg(COL_HIGHLIGHT)),
            Span::raw(d.to_string()),
        ])
    };
    let text = vec![
        key("1 / 2 / 3", "Dashboard / Analysis / Viewer"),
        key("Space", "Pause or resume the MD worker"),
        key("a", "Toggle auto-rotation"),
        key("+ / -", "Zoom"),
        key("r", "Reset view"),
        key("q / Esc", "Quit"),
        Line::from(" "),
        Line::from(vec![
            Span::styled("blue", Style::default().fg(COL_CONFIDENT)),
            Span::raw(" below add threshold, "),
            Span::styled("yellow", Style::default().fg(COL_UNCERTAIN)),
            Span::raw(" would be added, "),
            Span::styled("red", Style::default().fg(COL_QUERY)),
            Span::raw(" triggers an oracle call"),
        ]),
    ];
    let p = Paragraph::new(text)
        .block(Block::default().borders(Borders::ALL).title(" Help "))
        .wrap(Wrap { trim: true });
    f.render_widget(p, area);
}
