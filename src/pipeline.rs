//! Pipeline orchestration: the single-pass SGM inference and the
//! hierarchical mutual-information variant that bootstraps its own cost
//! model across an image pyramid.

use image::GrayImage;

use crate::aggregation::PathAggregator;
use crate::config::SgmConfig;
use crate::cost::{check_input_pair, CensusCost, CostVolumeBuilder};
use crate::mutual_information::StereoMutualInformation;
use crate::pyramid::{suggested_levels, ImagePyramid};
use crate::selector::{extract_score, subpixel_refine, DisparitySelector};
use crate::tensor::{CostTensor, MAX_COST};
use crate::{DisparityImage, DisparityMap, Result, ScoreMap, SgmError};

/// Output of one SGM inference.
#[derive(Debug, Clone)]
pub struct SgmResult {
    pub disparity: DisparityImage,
    pub subpixel: Option<DisparityMap>,
    pub score: Option<ScoreMap>,
}

/// Runs cost volume -> path aggregation -> disparity selection once, with
/// the optional sub-pixel/score post-pass. A pure function of its inputs:
/// identical images and configuration produce bit-identical output.
pub struct StereoDisparityPipeline {
    config: SgmConfig,
    aggregator: PathAggregator,
    selector: DisparitySelector,
    cost: CostTensor,
}

impl StereoDisparityPipeline {
    pub fn new(config: SgmConfig) -> Result<Self> {
        config.validate()?;
        crate::parallel::init_global_thread_pool()?;

        let mut aggregator = PathAggregator::new();
        aggregator.paths = config.paths;
        aggregator.penalty1 = config.penalty1;
        aggregator.penalty2 = config.penalty2;
        aggregator.use_parallel = config.use_parallel;

        let selector = DisparitySelector {
            max_error: config.max_error,
            right_to_left_tolerance: config.right_to_left_tolerance,
            texture_threshold: config.texture_threshold,
            use_parallel: config.use_parallel,
        };

        Ok(Self {
            config,
            aggregator,
            selector,
            cost: CostTensor::new(),
        })
    }

    pub fn config(&self) -> &SgmConfig {
        &self.config
    }

    /// Runs one inference with the supplied cost builder.
    pub fn process_with(
        &mut self,
        builder: &mut dyn CostVolumeBuilder,
        left: &GrayImage,
        right: &GrayImage,
    ) -> Result<SgmResult> {
        let (width, height) = check_input_pair(left, right)?;
        tracing::debug!(width, height, "computing cost volume");

        builder.configure(self.config.disparity_min, self.config.disparity_range);
        builder.process(left, right, &mut self.cost)?;

        tracing::debug!(paths = self.config.paths.count(), "aggregating path costs");
        self.aggregator.process(&self.cost)?;
        let aggregated = self.aggregator.aggregated();

        let mut disparity = DisparityImage::new(0, 0, 0, 1);
        self.selector.select(&self.cost, aggregated, &mut disparity)?;

        let (subpixel, score) = if self.config.subpixel {
            (
                Some(subpixel_refine(aggregated, &disparity)),
                Some(extract_score(aggregated, &disparity)),
            )
        } else {
            (None, None)
        };

        Ok(SgmResult {
            disparity,
            subpixel,
            score,
        })
    }
}

/// One-call census-cost SGM disparity computation.
pub fn sgm_disparity(left: &GrayImage, right: &GrayImage, config: SgmConfig) -> Result<SgmResult> {
    let mut pipeline = StereoDisparityPipeline::new(config)?;
    let mut builder = CensusCost::new();
    pipeline.process_with(&mut builder, left, right)
}

/// Configuration for the hierarchical mutual-information pipeline.
#[derive(Debug, Clone)]
pub struct HmiConfig {
    pub sgm: SgmConfig,
    /// Pyramid levels to use; 0 picks a size-dependent default.
    pub pyramid_levels: usize,
    /// Whole-image refinement iterations after the finest level.
    pub extra_iterations: usize,
    /// Smallest disparity range allowed at the coarsest level.
    pub min_coarse_range: usize,
}

impl Default for HmiConfig {
    fn default() -> Self {
        Self {
            sgm: SgmConfig::default(),
            pyramid_levels: 0,
            extra_iterations: 0,
            min_coarse_range: 4,
        }
    }
}

impl HmiConfig {
    pub fn validate(&self) -> Result<()> {
        self.sgm.validate()?;
        if self.min_coarse_range == 0 {
            return Err(SgmError::InvalidConfiguration(
                "min_coarse_range must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the hierarchical loop currently is. Each transition consumes the
/// previous level's disparity map to re-estimate the cost model for the
/// next, finer pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HmiStage {
    /// Pyramid level being processed; the largest index is the coarsest.
    Level(usize),
    /// Full-resolution refinement iteration.
    ExtraIteration(usize),
    Done,
}

/// Alternately estimates a mutual-information cost model and a disparity
/// map, coarse to fine. The model starts from a diagonal-intensity prior,
/// and each level's disparity result re-estimates it for the next level.
/// Validation gates run only at the finest level; disabling them on the
/// coarse passes produces a better-converged model.
pub struct HierarchicalMi {
    config: HmiConfig,
    mi: StereoMutualInformation,
}

impl HierarchicalMi {
    pub fn new(config: HmiConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            mi: StereoMutualInformation::new(),
        })
    }

    pub fn mutual_information(&self) -> &StereoMutualInformation {
        &self.mi
    }

    pub fn process(&mut self, left: &GrayImage, right: &GrayImage) -> Result<SgmResult> {
        let (width, height) = check_input_pair(left, right)?;

        let levels = if self.config.pyramid_levels > 0 {
            self.config.pyramid_levels
        } else {
            suggested_levels(
                width,
                height,
                self.config.sgm.disparity_range,
                self.config.min_coarse_range,
            )
        };
        let left_pyramid = ImagePyramid::build(left, levels);
        let right_pyramid = ImagePyramid::build(right, levels);

        // Fresh prior on every call keeps the pipeline a pure function of
        // its inputs
        self.mi.diagonal_histogram(1.0, MAX_COST);

        let mut result = None;
        let mut stage = HmiStage::Level(levels - 1);
        loop {
            stage = match stage {
                HmiStage::Level(level) => {
                    let level_left = left_pyramid.level(level);
                    let level_right = right_pyramid.level(level);
                    tracing::debug!(
                        level,
                        width = level_left.width(),
                        height = level_left.height(),
                        "hierarchical MI pass"
                    );

                    let mut pipeline =
                        StereoDisparityPipeline::new(self.level_config(level))?;
                    let res = pipeline.process_with(&mut self.mi, level_left, level_right)?;

                    let next = if level > 0 {
                        HmiStage::Level(level - 1)
                    } else if self.config.extra_iterations > 0 {
                        HmiStage::ExtraIteration(0)
                    } else {
                        HmiStage::Done
                    };
                    if next != HmiStage::Done {
                        self.reestimate(level_left, level_right, &res.disparity)?;
                    }
                    result = Some(res);
                    next
                }
                HmiStage::ExtraIteration(iteration) => {
                    tracing::debug!(iteration, "whole-image refinement");
                    let mut pipeline = StereoDisparityPipeline::new(self.level_config(0))?;
                    let res = pipeline.process_with(&mut self.mi, left, right)?;

                    let next = if iteration + 1 < self.config.extra_iterations {
                        HmiStage::ExtraIteration(iteration + 1)
                    } else {
                        HmiStage::Done
                    };
                    if next != HmiStage::Done {
                        self.reestimate(left, right, &res.disparity)?;
                    }
                    result = Some(res);
                    next
                }
                HmiStage::Done => break,
            };
        }

        result.ok_or_else(|| {
            SgmError::InvalidConfiguration("image pyramid produced no levels".to_string())
        })
    }

    fn reestimate(
        &mut self,
        left: &GrayImage,
        right: &GrayImage,
        disparity: &DisparityImage,
    ) -> Result<()> {
        // A level that found nothing valid cannot improve the model; keep
        // the current one rather than failing the whole inference
        if disparity.valid_fraction() == 0.0 {
            tracing::debug!("no valid disparities, keeping previous cost model");
            return Ok(());
        }
        self.mi.process(left, right, disparity)?;
        self.mi.precompute_scaled_cost(MAX_COST);
        Ok(())
    }

    /// Scales the disparity window to a pyramid level and disables the
    /// validation gates everywhere except the finest level.
    fn level_config(&self, level: usize) -> SgmConfig {
        let scale = 1usize << level;
        let mut config = self.config.sgm.clone();
        config.disparity_min /= scale;
        config.disparity_range = (config.disparity_range / scale)
            .max(self.config.min_coarse_range.min(self.config.sgm.disparity_range))
            .max(1);
        if level > 0 {
            config.texture_threshold = 0.0;
            config.right_to_left_tolerance = -1;
            // Sub-pixel output is only of interest at full resolution
            config.subpixel = false;
        }
        config
    }
}
