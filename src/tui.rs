use crate::session::SessionObserver;
use crate::session_view::SessionView;
use crate::types::{Direction as Speaker, SessionStatus};
use anyhow::Result;
use chrono::Timelike;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Gauge, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

/// TUIアプリケーション
pub struct TuiApp {
    observer: SessionObserver,
    view: SessionView,
    running: Arc<AtomicBool>,
    title: String,
}

impl TuiApp {
    pub fn new(
        observer: SessionObserver,
        running: Arc<AtomicBool>,
        history_limit: usize,
        title: impl Into<String>,
    ) -> Self {
        Self {
            observer,
            view: SessionView::new(history_limit),
            running,
            title: title.into(),
        }
    }

    /// TUIを起動
    ///
    /// `q` / Esc / Ctrl+C で終了する。
    pub async fn run(&mut self) -> Result<()> {
        // ターミナルを初期化
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        loop {
            self.view.refresh(&self.observer);
            terminal.draw(|f| self.draw(f))?;

            // イベントをポーリング（100msごと）。待ちはブロッキングスレッドで行う
            let polled = tokio::task::spawn_blocking(|| -> io::Result<Option<Event>> {
                if event::poll(Duration::from_millis(100))? {
                    Ok(Some(event::read()?))
                } else {
                    Ok(None)
                }
            })
            .await??;

            if let Some(Event::Key(key)) = polled {
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => {
                        self.running.store(false, Ordering::SeqCst);
                        break;
                    }
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        self.running.store(false, Ordering::SeqCst);
                        break;
                    }
                    KeyCode::Char('z') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        // Ctrl+Z でプロセスを一時停止
                        disable_raw_mode()?;
                        execute!(io::stdout(), LeaveAlternateScreen)?;

                        #[cfg(unix)]
                        {
                            use nix::sys::signal::{self, Signal};
                            let _ = signal::raise(Signal::SIGTSTP);
                        }

                        // 再開後にターミナルを再初期化
                        enable_raw_mode()?;
                        execute!(io::stdout(), EnterAlternateScreen)?;
                        terminal.clear()?;
                    }
                    _ => {}
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
        }

        // ターミナルをリストア
        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        Ok(())
    }

    /// 画面を描画
    fn draw(&self, f: &mut Frame) {
        let block = Block::default()
            .title(format!("live-voice - {}  (q: 終了)", self.title))
            .borders(Borders::ALL)
            .style(Style::default().fg(Color::White));

        let inner_area = block.inner(f.area());
        f.render_widget(block, f.area());

        let sections = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1), // ステータス
                Constraint::Length(1), // 入力レベル
                Constraint::Length(4), // ライブ字幕
                Constraint::Min(0),    // 確定行
            ])
            .split(inner_area);

        self.draw_status(f, sections[0]);
        self.draw_level(f, sections[1]);
        self.draw_captions(f, sections[2]);
        self.draw_transcript(f, sections[3]);
    }

    fn draw_status(&self, f: &mut Frame, area: Rect) {
        let status = &self.view.status;
        let color = match status {
            SessionStatus::Connecting => Color::Yellow,
            SessionStatus::Listening => Color::Green,
            SessionStatus::Speaking => Color::Cyan,
            SessionStatus::Closed => Color::Gray,
            SessionStatus::Errored(_) => Color::Red,
        };

        let mut spans = vec![
            Span::styled("状態: ", Style::default().fg(Color::White)),
            Span::styled(
                status.label(),
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ),
            Span::raw(format!(" ({:.0}秒)", self.view.status_duration_secs())),
        ];

        if let SessionStatus::Errored(cause) = status {
            spans.push(Span::raw("  "));
            spans.push(Span::styled(cause.message.clone(), Style::default().fg(Color::Red)));
            if cause.retriable {
                spans.push(Span::raw(" (しばらく待ってから再試行できます)"));
            }
        }

        f.render_widget(Paragraph::new(Line::from(spans)), area);
    }

    fn draw_level(&self, f: &mut Frame, area: Rect) {
        let level = self.view.level.clamp(0.0, 100.0);
        let gauge = Gauge::default()
            .label(format!("入力: {:.0}", level))
            .gauge_style(Style::default().fg(Color::Cyan))
            .ratio(level as f64 / 100.0);
        f.render_widget(gauge, area);
    }

    fn draw_captions(&self, f: &mut Frame, area: Rect) {
        let captions = &self.view.captions;
        let lines = vec![
            Self::speaker_line(Speaker::Caller, &captions.caller),
            Self::speaker_line(Speaker::Remote, &captions.remote),
        ];
        let paragraph = Paragraph::new(Text::from(lines))
            .block(Block::default().borders(Borders::TOP).title("字幕"))
            .wrap(Wrap { trim: false });
        f.render_widget(paragraph, area);
    }

    fn draw_transcript(&self, f: &mut Frame, area: Rect) {
        let lines: Vec<Line> = self
            .view
            .recent
            .iter()
            .rev() // 最新が上
            .map(|line| {
                let local = line.recorded_at.with_timezone(&chrono::Local);
                let mut spans = vec![Span::styled(
                    format!("[{:02}:{:02}] ", local.hour(), local.minute()),
                    Style::default()
                        .fg(Color::Green)
                        .add_modifier(Modifier::BOLD),
                )];
                spans.extend(Self::speaker_line(line.direction, &line.text).spans);
                Line::from(spans)
            })
            .collect();

        let paragraph = Paragraph::new(Text::from(lines))
            .block(Block::default().borders(Borders::TOP).title("会話"))
            .wrap(Wrap { trim: false });
        f.render_widget(paragraph, area);
    }

    fn speaker_line(speaker: Speaker, text: &str) -> Line<'static> {
        let (label, color) = match speaker {
            Speaker::Caller => ("あなた", Color::Blue),
            Speaker::Remote => ("相手", Color::Magenta),
        };
        Line::from(vec![
            Span::styled(
                format!("{}: ", label),
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ),
            Span::raw(text.to_string()),
        ])
    }
}
