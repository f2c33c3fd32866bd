use ab_glyph::{FontVec, PxScale};
use chrono::{DateTime, TimeZone};
use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{Rgba, RgbaImage, imageops};
use std::fmt::Display;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use crate::config::OverlayConfig;

/// Added to the measured text size; the text sits at half of it from the edge
pub const PADDING: u32 = 10;

pub const DEFAULT_TEXT_COLOR: &str = "white";
pub const DEFAULT_BACKGROUND: &str = "black";

const TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %H:%M:%S";
const GLYPH_SIZE: u32 = 8;

/// Overlay problems that degrade the label but never fail a capture
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompositeError {
    #[error("unknown color {value:?}, using {fallback}")]
    UnknownColor { value: String, fallback: &'static str },

    #[error("font {path} unusable ({message}), using the built-in font")]
    Font { path: String, message: String },
}

const NAMED_COLORS: &[(&str, [u8; 3])] = &[
    ("black", [0, 0, 0]),
    ("white", [255, 255, 255]),
    ("silver", [192, 192, 192]),
    ("gray", [128, 128, 128]),
    ("grey", [128, 128, 128]),
    ("red", [255, 0, 0]),
    ("maroon", [128, 0, 0]),
    ("green", [0, 128, 0]),
    ("lime", [0, 255, 0]),
    ("blue", [0, 0, 255]),
    ("navy", [0, 0, 128]),
    ("yellow", [255, 255, 0]),
    ("orange", [255, 165, 0]),
    ("cyan", [0, 255, 255]),
    ("magenta", [255, 0, 255]),
    ("purple", [128, 0, 128]),
    ("teal", [0, 128, 128]),
];

fn hex_nibbles(hex: &str) -> Option<Vec<u8>> {
    hex.chars()
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect()
}

/// Parse a CSS-style color name, `#rgb`, `#rrggbb`, `#rrggbbaa` or `transparent`
pub fn parse_color(value: &str) -> Option<Rgba<u8>> {
    let value = value.trim().to_ascii_lowercase();
    if value == "transparent" {
        return Some(Rgba([0, 0, 0, 0]));
    }
    if let Some(hex) = value.strip_prefix('#') {
        let n = hex_nibbles(hex)?;
        return match n.len() {
            3 => Some(Rgba([n[0] * 17, n[1] * 17, n[2] * 17, 255])),
            6 => Some(Rgba([n[0] << 4 | n[1], n[2] << 4 | n[3], n[4] << 4 | n[5], 255])),
            8 => Some(Rgba([
                n[0] << 4 | n[1],
                n[2] << 4 | n[3],
                n[4] << 4 | n[5],
                n[6] << 4 | n[7],
            ])),
            _ => None,
        };
    }
    NAMED_COLORS
        .iter()
        .find(|(name, _)| *name == value)
        .map(|(_, [r, g, b])| Rgba([*r, *g, *b, 255]))
}

fn color_or(
    value: &str,
    fallback: &'static str,
    warnings: &mut Vec<CompositeError>,
) -> Rgba<u8> {
    match parse_color(value) {
        Some(color) => color,
        None => {
            warnings.push(CompositeError::UnknownColor {
                value: value.to_string(),
                fallback,
            });
            parse_color(fallback).unwrap_or(Rgba([0, 0, 0, 255]))
        }
    }
}

/// `"<name> - <time>"`, or just the name when no time is given
pub fn label_text<Tz>(name: &str, time: Option<&DateTime<Tz>>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    match time {
        Some(time) => format!("{} - {}", name, time.format(TIMESTAMP_FORMAT)),
        None => name.to_string(),
    }
}

enum Glyphs {
    Builtin,
    TrueType(FontVec),
}

pub struct Rendered {
    pub canvas: RgbaImage,
    pub warnings: Vec<CompositeError>,
}

/// Draws the camera label onto stills.
pub struct OverlayCompositor {
    glyphs: Glyphs,
    font_warning: Option<CompositeError>,
}

impl Default for OverlayCompositor {
    fn default() -> Self {
        Self::builtin()
    }
}

impl OverlayCompositor {
    pub fn builtin() -> Self {
        Self {
            glyphs: Glyphs::Builtin,
            font_warning: None,
        }
    }

    /// Load the configured font, keeping the built-in one if that fails
    pub fn from_config(config: &OverlayConfig) -> Self {
        match &config.font_path {
            Some(path) => Self::with_font_file(path),
            None => Self::builtin(),
        }
    }

    pub fn with_font_file(path: &Path) -> Self {
        let loaded = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|data| FontVec::try_from_vec(data).map_err(|e| e.to_string()));
        match loaded {
            Ok(font) => Self {
                glyphs: Glyphs::TrueType(font),
                font_warning: None,
            },
            Err(message) => {
                let warning = CompositeError::Font {
                    path: path.display().to_string(),
                    message,
                };
                warn!("{}", warning);
                Self {
                    glyphs: Glyphs::Builtin,
                    font_warning: Some(warning),
                }
            }
        }
    }

    fn builtin_scale(font_size: u32) -> u32 {
        (font_size / GLYPH_SIZE).max(1)
    }

    /// Bounding box of `text` at `font_size`
    pub fn measure(&self, text: &str, font_size: u32) -> (u32, u32) {
        match &self.glyphs {
            Glyphs::Builtin => {
                let scale = Self::builtin_scale(font_size);
                let chars = text.chars().count() as u32;
                (chars.saturating_mul(GLYPH_SIZE * scale), GLYPH_SIZE * scale)
            }
            Glyphs::TrueType(font) => {
                imageproc::drawing::text_size(PxScale::from(font_size.max(1) as f32), font, text)
            }
        }
    }

    /// Text on a solid canvas sized to the text plus [`PADDING`].
    /// Unknown colors fall back to white text on black.
    pub fn render(
        &self,
        text: &str,
        font_size: u32,
        text_color: &str,
        background: &str,
    ) -> Rendered {
        let mut warnings: Vec<CompositeError> = self.font_warning.iter().cloned().collect();
        let fg = color_or(text_color, DEFAULT_TEXT_COLOR, &mut warnings);
        let bg = color_or(background, DEFAULT_BACKGROUND, &mut warnings);

        let (w, h) = self.measure(text, font_size);
        let mut canvas =
            RgbaImage::from_pixel(w.saturating_add(PADDING), h.saturating_add(PADDING), bg);
        let origin = PADDING / 2;

        match &self.glyphs {
            Glyphs::Builtin => {
                draw_builtin(&mut canvas, origin, origin, Self::builtin_scale(font_size), text, fg)
            }
            Glyphs::TrueType(font) => imageproc::drawing::draw_text_mut(
                &mut canvas,
                fg,
                origin as i32,
                origin as i32,
                PxScale::from(font_size.max(1) as f32),
                font,
                text,
            ),
        }

        Rendered { canvas, warnings }
    }

    /// Paste `canvas` onto `base` with its top-left corner at `offset`
    pub fn composite(mut base: RgbaImage, canvas: &RgbaImage, offset: (i64, i64)) -> RgbaImage {
        imageops::overlay(&mut base, canvas, offset.0, offset.1);
        base
    }
}

fn draw_builtin(canvas: &mut RgbaImage, x0: u32, y0: u32, scale: u32, text: &str, color: Rgba<u8>) {
    let fallback = BASIC_FONTS.get('?').unwrap_or([0; 8]);
    for (i, c) in text.chars().enumerate() {
        let glyph = BASIC_FONTS.get(c).unwrap_or(fallback);
        let gx = x0 + i as u32 * GLYPH_SIZE * scale;
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_SIZE {
                if bits & (1 << col) == 0 {
                    continue;
                }
                let px = gx + col * scale;
                let py = y0 + row as u32 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        if px + dx < canvas.width() && py + dy < canvas.height() {
                            canvas.put_pixel(px + dx, py + dy, color);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[test]
    fn test_render_canvas_size_and_background() {
        let compositor = OverlayCompositor::builtin();
        let (w, h) = compositor.measure("CAM-1", 18);
        assert_eq!((w, h), (80, 16));

        let rendered = compositor.render("CAM-1", 18, "silver", "black");
        let canvas = &rendered.canvas;
        assert!(rendered.warnings.is_empty());
        assert_eq!(canvas.dimensions(), (w + PADDING, h + PADDING));

        let black = Rgba([0, 0, 0, 255]);
        for x in 0..canvas.width() {
            assert_eq!(*canvas.get_pixel(x, 0), black);
            assert_eq!(*canvas.get_pixel(x, canvas.height() - 1), black);
        }
        for y in 0..canvas.height() {
            assert_eq!(*canvas.get_pixel(0, y), black);
            assert_eq!(*canvas.get_pixel(canvas.width() - 1, y), black);
        }
        assert!(canvas.pixels().any(|p| *p == Rgba([192, 192, 192, 255])));
        assert!(canvas.pixels().all(|p| *p == black || *p == Rgba([192, 192, 192, 255])));
    }

    #[test]
    fn test_unknown_colors_fall_back() {
        let rendered = OverlayCompositor::builtin().render("x", 8, "not-a-color", "#zz");
        assert_eq!(rendered.warnings.len(), 2);
        assert_eq!(*rendered.canvas.get_pixel(0, 0), Rgba([0, 0, 0, 255]));
        assert!(rendered.canvas.pixels().any(|p| *p == Rgba([255, 255, 255, 255])));
    }

    #[test]
    fn test_parse_color() {
        assert_eq!(parse_color("Silver"), Some(Rgba([192, 192, 192, 255])));
        assert_eq!(parse_color("#f80"), Some(Rgba([255, 136, 0, 255])));
        assert_eq!(parse_color("#102030"), Some(Rgba([16, 32, 48, 255])));
        assert_eq!(parse_color("#10203080"), Some(Rgba([16, 32, 48, 128])));
        assert_eq!(parse_color("transparent"), Some(Rgba([0, 0, 0, 0])));
        assert_eq!(parse_color("chartreuse-ish"), None);
    }

    #[test]
    fn test_missing_font_uses_builtin() {
        let compositor = OverlayCompositor::with_font_file(Path::new("/nonexistent/font.ttf"));
        let rendered = compositor.render("CAM-1", 18, "white", "black");
        assert!(matches!(
            rendered.warnings.as_slice(),
            [CompositeError::Font { .. }]
        ));
        assert_eq!(rendered.canvas.dimensions(), (90, 26));
    }

    #[test]
    fn test_composite_top_left() {
        let base = RgbaImage::from_pixel(200, 100, Rgba([10, 200, 10, 255]));
        let rendered = OverlayCompositor::builtin().render("AB", 8, "white", "black");
        let (cw, ch) = rendered.canvas.dimensions();

        let out = OverlayCompositor::composite(base, &rendered.canvas, (0, 0));
        assert_eq!(out.dimensions(), (200, 100));
        assert_eq!(*out.get_pixel(0, 0), Rgba([0, 0, 0, 255]));
        assert_eq!(*out.get_pixel(cw, ch), Rgba([10, 200, 10, 255]));
        assert_eq!(*out.get_pixel(199, 99), Rgba([10, 200, 10, 255]));
    }

    #[test]
    fn test_label_text() {
        let time = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 15, 8, 30, 5)
            .unwrap();
        assert_eq!(
            label_text("yard", Some(&time)),
            "yard - Mon, 15 Jan 2024 08:30:05"
        );
        assert_eq!(label_text::<FixedOffset>("yard", None), "yard");
    }
}
