use super::BoxPx;

pub(crate) const MIN_BOX_SIDE: u32 = 10;
pub(crate) const MAX_BOX_SIDE: u32 = 2000;
pub(crate) const MAX_OFFSET: i32 = 2000;

/// How the caption box is placed on an image before it reaches the layout
/// engine. Both variants center the box and then shift it by the offsets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoxSettings {
    Fixed {
        width: u32,
        height: u32,
        x_offset: i32,
        y_offset: i32,
    },
    Percent {
        width_pct: f32,
        height_pct: f32,
        x_offset_pct: f32,
        y_offset_pct: f32,
    },
}

impl Default for BoxSettings {
    fn default() -> Self {
        BoxSettings::Fixed {
            width: 400,
            height: 200,
            x_offset: 0,
            y_offset: 0,
        }
    }
}

impl BoxSettings {
    pub fn resolve(&self, image_width: u32, image_height: u32) -> BoxPx {
        let (w, h, x_offset, y_offset) = match *self {
            BoxSettings::Fixed {
                width,
                height,
                x_offset,
                y_offset,
            } => (
                width.clamp(MIN_BOX_SIDE, MAX_BOX_SIDE),
                height.clamp(MIN_BOX_SIDE, MAX_BOX_SIDE),
                x_offset.clamp(-MAX_OFFSET, MAX_OFFSET),
                y_offset.clamp(-MAX_OFFSET, MAX_OFFSET),
            ),
            BoxSettings::Percent {
                width_pct,
                height_pct,
                x_offset_pct,
                y_offset_pct,
            } => (
                percent_of(image_width, width_pct).max(1.0) as u32,
                percent_of(image_height, height_pct).max(1.0) as u32,
                percent_of(image_width, x_offset_pct) as i32,
                percent_of(image_height, y_offset_pct) as i32,
            ),
        };
        BoxPx {
            x: centered(image_width, w) + x_offset,
            y: centered(image_height, h) + y_offset,
            w,
            h,
        }
    }
}

fn percent_of(total: u32, pct: f32) -> f32 {
    (total as f32 * pct.clamp(-100.0, 100.0) / 100.0).round()
}

fn centered(total: u32, size: u32) -> i32 {
    (total as i64 - size as i64).div_euclid(2) as i32
}
