use crate::{calibrate_row, AcquisitionSession, ChannelConfig, Conf, Progress, Tick};
use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::error;
use ndarray::s;
use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Layout, Rect},
    style::{Color, Style, Stylize},
    symbols::{self, border},
    text::{Line, Text},
    widgets::{Axis, Block, Chart, Dataset, GraphType, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::time::Duration;

const COLORS: [Color; 6] = [
    Color::Cyan,
    Color::Yellow,
    Color::Magenta,
    Color::Green,
    Color::Red,
    Color::Blue,
];

/// Terminal chart of the calibrated buffer, redrawn on every host-loop tick.
#[derive(Debug)]
pub struct LiveMonitor {
    pub session_name: String,
    pub channels: Vec<ChannelConfig>,
    pub total_time: f64,
    pub sample_rate: f64,
    pub y_bounds: [f64; 2],
    pub progress: Progress,
    pub points: Vec<Vec<(f64, f64)>>,
    pub width: usize,
    pub quit: bool,
    pub done: bool,
    failure: Option<anyhow::Error>,
}

impl LiveMonitor {
    pub fn new(config: &Conf) -> Self {
        Self {
            session_name: config.run_settings.session_name.clone(),
            channels: config.channels.clone(),
            total_time: config.run_settings.total_time,
            sample_rate: config.run_settings.sample_rate,
            y_bounds: config.y_bounds(),
            progress: Progress::new(config.total_samples()),
            points: vec![Vec::new(); config.channels.len()],
            width: 200,
            quit: false,
            done: false,
            failure: None,
        }
    }

    /// Host-loop callback: redraw, then turn a `q` press or a terminal error into a stop request.
    pub fn on_tick(&mut self, terminal: &mut DefaultTerminal, session: &AcquisitionSession) -> Tick {
        match self.tick(terminal, session) {
            Ok(tick) => tick,
            Err(e) => {
                error!("live monitor failed: {e}");
                self.failure = Some(e);
                Tick::StopRequested
            }
        }
    }

    /// Error that made `on_tick` stop the session, if any.
    pub fn take_failure(&mut self) -> Option<anyhow::Error> {
        self.failure.take()
    }

    /// Keep the final trace on screen until the operator dismisses it.
    pub fn linger(&mut self, terminal: &mut DefaultTerminal, session: &AcquisitionSession) -> Result<()> {
        self.done = true;
        self.quit = false;
        self.refresh(session);
        while !self.quit {
            terminal.draw(|f| self.draw(f))?;
            if event::poll(Duration::from_millis(250))? {
                self.handle_event(event::read()?);
            }
        }
        Ok(())
    }

    fn tick(&mut self, terminal: &mut DefaultTerminal, session: &AcquisitionSession) -> Result<Tick> {
        self.refresh(session);
        terminal.draw(|f| self.draw(f))?;
        self.handle_events()?;
        Ok(if self.quit {
            Tick::StopRequested
        } else {
            Tick::Continue
        })
    }

    /// Re-apply clip and calibration to a decimated copy of every buffer row.
    pub fn refresh(&mut self, session: &AcquisitionSession) {
        let buffer = session.buffer();
        self.progress.update(buffer.next_offset());
        let total = buffer.total_samples();
        let stride = (total / self.width.max(1)).max(1);
        let dt = 1.0 / self.sample_rate;

        for (ch, channel) in self.channels.iter().enumerate() {
            let raw = buffer.read_all(ch);
            let decimated = raw.slice(s![..;stride]);
            let calibrated =
                calibrate_row(decimated, &channel.calibration_coeffs, channel.clip_range);
            self.points[ch] = calibrated
                .iter()
                .enumerate()
                .map(|(i, &y)| ((i * stride) as f64 * dt, y))
                .collect();
        }
    }

    fn draw(&mut self, frame: &mut Frame) {
        self.width = (frame.area().width as usize * 2).max(1);
        frame.render_widget(&*self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            self.handle_event(event::read()?);
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Key(key_event) if key_event.kind == KeyEventKind::Press => {
                self.handle_key_event(key_event)
            }
            _ => {}
        }
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        if let KeyCode::Char('q') = key_event.code {
            self.quit = true;
        }
    }
}

impl Widget for &LiveMonitor {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let [chart_area, status_area] =
            Layout::vertical([Constraint::Min(8), Constraint::Length(3)]).areas(area);

        let datasets: Vec<Dataset> = self
            .channels
            .iter()
            .zip(&self.points)
            .enumerate()
            .map(|(i, (channel, points))| {
                Dataset::default()
                    .name(channel.display_name())
                    .marker(symbols::Marker::Braille)
                    .graph_type(GraphType::Line)
                    .style(Style::default().fg(COLORS[i % COLORS.len()]))
                    .data(points)
            })
            .collect();

        let [y_min, y_max] = self.y_bounds;
        let x_labels = vec![
            "0".to_string(),
            format!("{:.0}", self.total_time / 2.0),
            format!("{:.0}", self.total_time),
        ];
        let y_labels = vec![
            format!("{y_min:.0}"),
            format!("{:.0}", (y_min + y_max) / 2.0),
            format!("{y_max:.0}"),
        ];
        let title = Line::from(format!(" {} ", self.session_name).bold());
        Chart::new(datasets)
            .block(Block::bordered().title(title.centered()))
            .x_axis(
                Axis::default()
                    .title("Time [s]")
                    .bounds([0.0, self.total_time])
                    .labels(x_labels),
            )
            .y_axis(Axis::default().bounds([y_min, y_max]).labels(y_labels))
            .hidden_legend_constraints((Constraint::Ratio(1, 2), Constraint::Ratio(1, 2)))
            .render(chart_area, buf);

        let state = if self.done {
            "End of data acquisition".green().bold()
        } else {
            "Acquiring".yellow()
        };
        let instructions = if self.done {
            Line::from(vec![" Exit ".into(), "<Q> ".blue().bold()])
        } else {
            Line::from(vec![" Stop ".into(), "<Q> ".blue().bold()])
        };
        let block = Block::bordered()
            .title_bottom(instructions.centered())
            .border_set(border::THICK);
        let status_text = Text::from(vec![Line::from(vec![
            state,
            "  Samples: ".into(),
            format!("{}/{}", self.progress.acquired, self.progress.total_samples).yellow(),
            format!(" ({:.0}%)", 100.0 * self.progress.fraction()).into(),
            "  Elapsed: ".into(),
            format!("{}", self.progress.elapsed().as_secs()).yellow(),
            " s".into(),
            "  Rate: ".into(),
            format!("{:.0}", self.progress.rate()).yellow(),
            " S/s".into(),
        ])]);
        Paragraph::new(status_text)
            .centered()
            .block(block)
            .render(status_area, buf);
    }
}
