//! Draws a voice-channel snapshot into a PNG.

use ab_glyph::{Font, FontArc, GlyphId, PxScale, ScaleFont, point};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::error::SnapshotError;

pub const WIDTH: u32 = 600;
const ROW_HEIGHT: u32 = 80;
const HEADER_HEIGHT: u32 = 50;
const FIRST_ROW_Y: u32 = 60;
const AVATAR_X: u32 = 20;
const AVATAR_SIZE: u32 = 50;
const NAME_X: u32 = 80;
const RIGHT_MARGIN: u32 = 10;

const TITLE_SIZE: f32 = 26.0;
const NAME_SIZE: f32 = 24.0;

const BACKGROUND: Rgba<u8> = Rgba([0x1e, 0x1e, 0x2f, 0xff]);
const TEXT: Rgba<u8> = Rgba([0xff, 0xff, 0xff, 0xff]);

static BUILTIN_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

pub struct RenderRow {
    pub display_name: String,
    pub avatar: Option<RgbaImage>,
}

/// The embedded face first, then any configured fallbacks. Each character is
/// drawn with the first face that has a glyph for it.
#[derive(Clone)]
pub struct TextFonts {
    faces: Vec<FontArc>,
}

impl TextFonts {
    pub fn builtin() -> Result<Self, SnapshotError> {
        Ok(Self {
            faces: vec![FontArc::try_from_slice(BUILTIN_FONT)?],
        })
    }

    /// Unreadable fallback files are skipped with a warning.
    pub fn with_fallbacks(paths: &[PathBuf]) -> Result<Self, SnapshotError> {
        let mut fonts = Self::builtin()?;
        for path in paths {
            let face = std::fs::read(path)
                .map_err(SnapshotError::from)
                .and_then(|bytes| FontArc::try_from_vec(bytes).map_err(SnapshotError::from));
            match face {
                Ok(face) => {
                    info!("Loaded fallback font {:?}", path);
                    fonts.faces.push(face);
                }
                Err(e) => warn!("Skipping fallback font {:?}: {}", path, e),
            }
        }
        Ok(fonts)
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    fn face_for(&self, ch: char) -> (usize, &FontArc) {
        self.faces
            .iter()
            .enumerate()
            .find(|(_, face)| face.glyph_id(ch) != GlyphId(0))
            .unwrap_or((0, &self.faces[0]))
    }
}

pub fn canvas_height(rows: usize) -> u32 {
    rows as u32 * ROW_HEIGHT + HEADER_HEIGHT
}

pub fn render_snapshot(
    fonts: &TextFonts,
    channel_name: &str,
    rows: &[RenderRow],
) -> Result<Vec<u8>, SnapshotError> {
    let mut canvas = RgbaImage::from_pixel(WIDTH, canvas_height(rows.len()), BACKGROUND);

    draw_text(
        &mut canvas,
        fonts,
        &format!("Voice Channel: {channel_name}"),
        (20, 10),
        TITLE_SIZE,
    );

    let mut y = FIRST_ROW_Y;
    for row in rows {
        if let Some(avatar) = &row.avatar {
            let scaled = imageops::resize(avatar, AVATAR_SIZE, AVATAR_SIZE, FilterType::Triangle);
            imageops::overlay(&mut canvas, &scaled, AVATAR_X as i64, y as i64);
        }
        // vertically centred against the avatar
        let text_y = y + (AVATAR_SIZE - NAME_SIZE as u32) / 2;
        draw_text(&mut canvas, fonts, &row.display_name, (NAME_X, text_y), NAME_SIZE);
        y += ROW_HEIGHT;
    }

    let mut png = Vec::new();
    DynamicImage::ImageRgba8(canvas).write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}

/// Draws `text` with its top-left corner at `origin`, stopping at the first
/// character that would cross the right margin.
fn draw_text(canvas: &mut RgbaImage, fonts: &TextFonts, text: &str, origin: (u32, u32), size: f32) {
    let scale = PxScale::from(size);
    let baseline = origin.1 as f32 + fonts.faces[0].as_scaled(scale).ascent();
    let limit = canvas.width().saturating_sub(RIGHT_MARGIN) as f32;

    let mut caret = origin.0 as f32;
    let mut previous: Option<(usize, GlyphId)> = None;
    for ch in text.chars() {
        let (index, face) = fonts.face_for(ch);
        let scaled = face.as_scaled(scale);
        let id = face.glyph_id(ch);
        if let Some((prev_index, prev_id)) = previous {
            if prev_index == index {
                caret += scaled.kern(prev_id, id);
            }
        }
        let advance = scaled.h_advance(id);
        if caret + advance > limit {
            break;
        }

        let glyph = id.with_scale_and_position(scale, point(caret, baseline));
        if let Some(outline) = face.outline_glyph(glyph) {
            let bounds = outline.px_bounds();
            outline.draw(|gx, gy, coverage| {
                blend(
                    canvas,
                    bounds.min.x as i64 + gx as i64,
                    bounds.min.y as i64 + gy as i64,
                    coverage,
                );
            });
        }
        caret += advance;
        previous = Some((index, id));
    }
}

fn blend(canvas: &mut RgbaImage, x: i64, y: i64, coverage: f32) {
    if x < 0 || y < 0 || x >= canvas.width() as i64 || y >= canvas.height() as i64 {
        return;
    }
    let alpha = coverage.clamp(0.0, 1.0);
    let pixel = canvas.get_pixel_mut(x as u32, y as u32);
    for channel in 0..3 {
        let under = pixel.0[channel] as f32;
        pixel.0[channel] = (under + (TEXT.0[channel] as f32 - under) * alpha).round() as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fonts() -> TextFonts {
        TextFonts::builtin().unwrap()
    }

    fn decode(png: &[u8]) -> RgbaImage {
        image::load_from_memory(png).unwrap().to_rgba8()
    }

    fn rows(n: usize) -> Vec<RenderRow> {
        (0..n)
            .map(|i| RenderRow {
                display_name: format!("member {i}"),
                avatar: None,
            })
            .collect()
    }

    fn named(name: &str) -> RgbaImage {
        let list = vec![RenderRow {
            display_name: name.to_string(),
            avatar: None,
        }];
        decode(&render_snapshot(&fonts(), "Lobby", &list).unwrap())
    }

    #[test]
    fn canvas_grows_with_occupants() {
        let img = decode(&render_snapshot(&fonts(), "Lobby", &rows(3)).unwrap());
        assert_eq!(img.dimensions(), (WIDTH, 3 * 80 + 50));

        let img = decode(&render_snapshot(&fonts(), "Lobby", &rows(5)).unwrap());
        assert_eq!(img.height(), 450);
    }

    #[test]
    fn avatar_is_drawn_at_row_origin() {
        let red = Rgba([0xff, 0x00, 0x00, 0xff]);
        let mut list = rows(3);
        list[1].avatar = Some(RgbaImage::from_pixel(128, 128, red));

        let img = decode(&render_snapshot(&fonts(), "Lobby", &list).unwrap());

        assert_eq!(*img.get_pixel(AVATAR_X + 25, FIRST_ROW_Y + ROW_HEIGHT + 25), red);
        // rows without an avatar leave the background showing
        assert_eq!(*img.get_pixel(AVATAR_X + 25, FIRST_ROW_Y + 25), BACKGROUND);
    }

    #[test]
    fn names_are_drawn_in_white() {
        let img = decode(&render_snapshot(&fonts(), "Lobby", &rows(3)).unwrap());
        let row = FIRST_ROW_Y..FIRST_ROW_Y + AVATAR_SIZE;
        let lit = (NAME_X..WIDTH)
            .flat_map(|x| row.clone().map(move |y| (x, y)))
            .filter(|&(x, y)| *img.get_pixel(x, y) == TEXT)
            .count();
        assert!(lit > 0);
    }

    #[test]
    fn different_names_draw_different_pixels() {
        assert_ne!(named("alice"), named("ALICE"));
        assert_ne!(named("Zoë"), named("Zoe"));
        assert_ne!(named("Дмитрий"), named("Дмитрию"));
    }

    #[test]
    fn long_names_are_clipped_to_canvas() {
        let list = vec![RenderRow {
            display_name: "x".repeat(500),
            avatar: None,
        }];
        let img = decode(&render_snapshot(&fonts(), "Lobby", &list).unwrap());
        for y in FIRST_ROW_Y..FIRST_ROW_Y + AVATAR_SIZE {
            assert_eq!(*img.get_pixel(WIDTH - 1, y), BACKGROUND);
        }
    }

    #[test]
    fn fallback_fonts_load_and_bad_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let copy = dir.path().join("copy.ttf");
        let junk = dir.path().join("junk.ttf");
        std::fs::write(&copy, BUILTIN_FONT).unwrap();
        std::fs::write(&junk, b"not a font").unwrap();

        let fonts =
            TextFonts::with_fallbacks(&[copy, junk, dir.path().join("missing.ttf")]).unwrap();

        assert_eq!(fonts.len(), 2);
    }

    #[test]
    fn characters_no_face_covers_use_the_primary_face() {
        let fonts = fonts();
        assert_eq!(fonts.face_for('a').0, 0);
        // DejaVu Sans has no CJK; the primary face draws its missing glyph
        assert_eq!(fonts.face_for('日').0, 0);
    }
}
