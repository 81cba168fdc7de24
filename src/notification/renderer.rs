//! Terminal rendering for notifications.

use owo_colors::{OwoColorize, Rgb};

use super::Notification;

/// Colors used for notification lines.
#[derive(Debug, Clone, Copy)]
pub struct Theme {
    /// Success state color - green (34, 197, 94)
    pub success: Rgb,
    /// Error state color - red (239, 68, 68)
    pub error: Rgb,
    /// Warning state color - yellow (234, 179, 8)
    pub warning: Rgb,
    /// Muted/secondary text color - gray (107, 114, 128)
    pub muted: Rgb,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            success: Rgb(34, 197, 94),
            error: Rgb(239, 68, 68),
            warning: Rgb(234, 179, 8),
            muted: Rgb(107, 114, 128),
        }
    }
}

/// Renders notifications as single terminal lines.
#[derive(Debug, Clone)]
pub struct NotificationRenderer {
    theme: Theme,
    colors_enabled: bool,
}

impl Default for NotificationRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationRenderer {
    /// Creates a renderer; colors are off when `NO_COLOR` is set.
    pub fn new() -> Self {
        Self {
            theme: Theme::default(),
            colors_enabled: std::env::var_os("NO_COLOR").is_none(),
        }
    }

    pub fn with_theme(mut self, theme: Theme) -> Self {
        self.theme = theme;
        self
    }

    pub fn with_colors(mut self, enabled: bool) -> Self {
        self.colors_enabled = enabled;
        self
    }

    fn icon(notification: &Notification) -> &'static str {
        match notification {
            Notification::NetworkConnected => "●",
            Notification::NetworkDisconnected => "○",
            Notification::CircuitOpened { .. } => "⚡",
            Notification::CircuitClosed { .. } => "↻",
            Notification::ProviderFailing { .. } => "⚠",
            Notification::ProviderRecovered { .. } => "✓",
            Notification::SlowResponse { .. } => "…",
        }
    }

    fn color(&self, notification: &Notification) -> Rgb {
        match notification {
            Notification::NetworkDisconnected | Notification::CircuitOpened { .. } => {
                self.theme.error
            }
            Notification::ProviderFailing { .. } | Notification::SlowResponse { .. } => {
                self.theme.warning
            }
            _ => self.theme.success,
        }
    }

    /// Renders `notification` as `<icon> <title>  <description>`.
    pub fn render(&self, notification: &Notification) -> String {
        let icon = Self::icon(notification);
        let title = notification.title();
        let description = notification.description();

        if !self.colors_enabled {
            return format!("{icon} {title}  {description}");
        }

        let color = self.color(notification);
        format!(
            "{} {}  {}",
            icon.color(color),
            title.color(color).bold(),
            description.color(self.theme.muted)
        )
    }
}
