//! Three-axis position ids for interleaved text and vision tokens.
//!
//! Vision-language checkpoints rotate queries and keys with separate
//! temporal, height, and width phases. Text tokens advance all three axes
//! together; each vision segment spreads its tokens over the grid extents
//! reported by the image processor. The builder runs once per request,
//! upstream of the rotary encoder.

use candle_core::{Device, Tensor};

use crate::error::{CoreError, Result};

/// Grid extents of one vision segment after spatial merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisionGrid {
    pub temporal: usize,
    pub height: usize,
    pub width: usize,
}

impl VisionGrid {
    pub fn new(temporal: usize, height: usize, width: usize) -> Self {
        Self {
            temporal,
            height,
            width,
        }
    }

    /// Number of placeholder tokens the segment occupies in the sequence.
    pub fn num_tokens(&self) -> usize {
        self.temporal * self.height * self.width
    }

    fn max_extent(&self) -> usize {
        self.temporal.max(self.height).max(self.width)
    }
}

/// Scans a token sequence for vision-segment markers and synthesizes the
/// `[num_tokens, 3]` position-id matrix consumed by sectioned rotary.
///
/// Marker tokens themselves are ordinary text tokens: they take the running
/// text index. The tokens strictly between a start and end marker are the
/// vision run described by the matching grid.
#[derive(Debug, Clone)]
pub struct PositionIdBuilder {
    vision_start_token_id: u32,
    vision_end_token_id: u32,
}

impl PositionIdBuilder {
    pub fn new(vision_start_token_id: u32, vision_end_token_id: u32) -> Result<Self> {
        if vision_start_token_id == vision_end_token_id {
            return Err(CoreError::config(format!(
                "vision start and end markers must differ, both are {vision_start_token_id}"
            )));
        }
        Ok(Self {
            vision_start_token_id,
            vision_end_token_id,
        })
    }

    /// Build position ids for one request.
    ///
    /// `grids` holds one entry per vision segment, in the order the segments
    /// appear in `tokens`. With no grids the three axes collapse to the plain
    /// running index. Each vision segment assigns the Cartesian product of
    /// its extents, temporal slowest, offset so ids never overlap a
    /// preceding segment; the text run after a segment resumes one past the
    /// segment's maximum id.
    pub fn build(&self, tokens: &[u32], grids: &[VisionGrid], device: &Device) -> Result<Tensor> {
        if grids.is_empty() {
            return Self::arange_ids(tokens.len(), device);
        }

        let mut flat = Vec::with_capacity(tokens.len() * 3);
        let mut running = 0u32;
        let mut next_grid = 0usize;
        let mut i = 0usize;
        while i < tokens.len() {
            if tokens[i] != self.vision_start_token_id {
                flat.extend([running; 3]);
                running += 1;
                i += 1;
                continue;
            }

            // The start marker is a text token.
            flat.extend([running; 3]);
            running += 1;
            i += 1;

            let grid = grids.get(next_grid).ok_or_else(|| {
                CoreError::shape(
                    "vision segments",
                    format!("{} grids", grids.len()),
                    format!("start marker {} at token {}", next_grid + 1, i - 1),
                )
            })?;
            next_grid += 1;
            if grid.num_tokens() == 0 {
                return Err(CoreError::config(format!(
                    "vision grid {grid:?} has a zero extent"
                )));
            }

            let span = grid.num_tokens();
            if tokens.get(i + span) != Some(&self.vision_end_token_id) {
                return Err(CoreError::shape(
                    format!("vision segment {next_grid}"),
                    format!("{span} vision tokens then an end marker"),
                    format!("{} tokens remaining", tokens.len() - i),
                ));
            }

            let offset = running;
            for t in 0..grid.temporal as u32 {
                for h in 0..grid.height as u32 {
                    for w in 0..grid.width as u32 {
                        flat.extend([offset + t, offset + h, offset + w]);
                    }
                }
            }
            // Text resumes one past the largest id the segment produced.
            running = offset + grid.max_extent() as u32;
            i += span;
        }

        if next_grid != grids.len() {
            return Err(CoreError::shape(
                "vision segments",
                format!("{} start markers", grids.len()),
                format!("{next_grid}"),
            ));
        }

        Ok(Tensor::from_vec(flat, (tokens.len(), 3), device)?)
    }

    fn arange_ids(num_tokens: usize, device: &Device) -> Result<Tensor> {
        let mut flat = Vec::with_capacity(num_tokens * 3);
        for p in 0..num_tokens as u32 {
            flat.extend([p; 3]);
        }
        Ok(Tensor::from_vec(flat, (num_tokens, 3), device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: u32 = 1000;
    const END: u32 = 1001;
    const PAD: u32 = 1002;

    fn builder() -> PositionIdBuilder {
        PositionIdBuilder::new(START, END).unwrap()
    }

    fn ids_to_axes(ids: &Tensor) -> (Vec<u32>, Vec<u32>, Vec<u32>) {
        let rows: Vec<Vec<u32>> = ids.to_vec2().unwrap();
        let t = rows.iter().map(|r| r[0]).collect();
        let h = rows.iter().map(|r| r[1]).collect();
        let w = rows.iter().map(|r| r[2]).collect();
        (t, h, w)
    }

    #[test]
    fn text_only_collapses_to_running_index() {
        let device = Device::Cpu;
        let ids = builder().build(&[7, 8, 9, 10], &[], &device).unwrap();

        assert_eq!(ids.dims(), &[4, 3]);
        let (t, h, w) = ids_to_axes(&ids);
        assert_eq!(t, vec![0, 1, 2, 3]);
        assert_eq!(h, vec![0, 1, 2, 3]);
        assert_eq!(w, vec![0, 1, 2, 3]);
    }

    #[test]
    fn no_grids_treats_markers_as_plain_text() {
        let device = Device::Cpu;
        let ids = builder()
            .build(&[7, START, PAD, END, 8], &[], &device)
            .unwrap();

        let (t, _, _) = ids_to_axes(&ids);
        assert_eq!(t, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn single_image_segment_spans_grid() {
        let device = Device::Cpu;
        // Three text tokens (marker included), a 1x2x2 image, end marker,
        // one trailing text token.
        let tokens = [10, 11, START, PAD, PAD, PAD, PAD, END, 12];
        let grids = [VisionGrid::new(1, 2, 2)];
        let ids = builder().build(&tokens, &grids, &device).unwrap();

        let (t, h, w) = ids_to_axes(&ids);
        assert_eq!(t, vec![0, 1, 2, 3, 3, 3, 3, 5, 6]);
        assert_eq!(h, vec![0, 1, 2, 3, 3, 4, 4, 5, 6]);
        assert_eq!(w, vec![0, 1, 2, 3, 4, 3, 4, 5, 6]);
    }

    #[test]
    fn temporal_axis_varies_slowest() {
        let device = Device::Cpu;
        let tokens = [START, PAD, PAD, PAD, PAD, END];
        let grids = [VisionGrid::new(2, 1, 2)];
        let ids = builder().build(&tokens, &grids, &device).unwrap();

        let (t, h, w) = ids_to_axes(&ids);
        assert_eq!(t, vec![0, 1, 1, 2, 2, 3]);
        assert_eq!(h, vec![0, 1, 1, 1, 1, 3]);
        assert_eq!(w, vec![0, 1, 2, 1, 2, 3]);
    }

    #[test]
    fn second_segment_continues_past_first_maximum() {
        let device = Device::Cpu;
        let tokens = [20, START, PAD, PAD, END, START, PAD, PAD, END, 21];
        let grids = [VisionGrid::new(1, 1, 2), VisionGrid::new(2, 1, 1)];
        let ids = builder().build(&tokens, &grids, &device).unwrap();

        let (t, h, w) = ids_to_axes(&ids);
        assert_eq!(t, vec![0, 1, 2, 2, 4, 5, 6, 7, 8, 9]);
        assert_eq!(h, vec![0, 1, 2, 2, 4, 5, 6, 6, 8, 9]);
        assert_eq!(w, vec![0, 1, 2, 3, 4, 5, 6, 6, 8, 9]);
    }

    #[test]
    fn truncated_segment_is_shape_error() {
        let device = Device::Cpu;
        let grids = [VisionGrid::new(1, 1, 2)];

        let err = builder()
            .build(&[START, PAD, PAD], &grids, &device)
            .unwrap_err();
        assert!(matches!(err, CoreError::Shape { .. }));

        // Wrong token where the end marker should sit.
        let err = builder()
            .build(&[START, PAD, PAD, 99], &grids, &device)
            .unwrap_err();
        assert!(matches!(err, CoreError::Shape { .. }));
    }

    #[test]
    fn marker_and_grid_counts_must_agree() {
        let device = Device::Cpu;

        // Two markers, one grid.
        let tokens = [START, PAD, END, START, PAD, END];
        let err = builder()
            .build(&tokens, &[VisionGrid::new(1, 1, 1)], &device)
            .unwrap_err();
        assert!(matches!(err, CoreError::Shape { .. }));

        // One marker, two grids.
        let tokens = [START, PAD, END];
        let grids = [VisionGrid::new(1, 1, 1), VisionGrid::new(1, 1, 1)];
        let err = builder().build(&tokens, &grids, &device).unwrap_err();
        assert!(matches!(err, CoreError::Shape { .. }));
    }

    #[test]
    fn degenerate_configurations_are_rejected() {
        let device = Device::Cpu;

        let err = PositionIdBuilder::new(5, 5).unwrap_err();
        assert!(matches!(err, CoreError::Configuration { .. }));

        let err = builder()
            .build(&[START, END], &[VisionGrid::new(0, 2, 2)], &device)
            .unwrap_err();
        assert!(matches!(err, CoreError::Configuration { .. }));
    }
}
