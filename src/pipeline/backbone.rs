use std::collections::BTreeMap;

use ndarray::{Array4, ArrayView4};

use crate::error::{Error, Result};

/// Layers of a ResNet trunk whose activations the segmentation heads consume.
pub const RESNET_TAP_LAYERS: [usize; 5] = [2, 4, 5, 6, 7];

/// Name under which [`TappedBackbone::tapped_features`] reports trunk layer `index`.
pub fn tap_name(index: usize) -> String {
    format!("layer{index}")
}

/// Per-image shape of a feature map, `channels x height x width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl FeatureShape {
    /// Output of a ResNet-34 trunk without its pooling and classifier, for 224 x 224 inputs.
    pub const RESNET34: FeatureShape = FeatureShape {
        channels: 512,
        height: 7,
        width: 7,
    };

    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that `features` is a batch of `batch_size` maps of this shape.
    pub fn check(&self, batch_size: usize, features: &Array4<f32>) -> Result<()> {
        let expected = (batch_size, self.channels, self.height, self.width);
        if features.dim() != expected {
            return Err(Error::shape("backbone features", expected, features.dim()));
        }
        Ok(())
    }
}

/// A pretrained image classifier used as an opaque feature extractor.
pub trait Backbone {
    /// Shape of [`Backbone::features`] for a single image.
    fn output_shape(&self) -> FeatureShape;

    /// `images` is `batch x 3 x height x width`, the result `batch x` [`Backbone::output_shape`].
    fn features(&self, images: ArrayView4<f32>) -> Result<Array4<f32>>;
}

/// A backbone that also exposes intermediate activations, keyed by layer name.
pub trait TappedBackbone: Backbone {
    /// Layers reported by [`TappedBackbone::tapped_features`], by default [`RESNET_TAP_LAYERS`].
    fn tap_layers(&self) -> Vec<String> {
        RESNET_TAP_LAYERS.iter().map(|&i| tap_name(i)).collect()
    }

    fn tapped_features(&self, images: ArrayView4<f32>) -> Result<BTreeMap<String, Array4<f32>>>;
}

/// Checks that a tapped forward pass reported exactly the layers the backbone advertises.
pub fn check_taps<B: TappedBackbone + ?Sized>(
    backbone: &B,
    taps: &BTreeMap<String, Array4<f32>>,
) -> Result<()> {
    let expected = backbone.tap_layers();
    if let Some(missing) = expected.iter().find(|name| !taps.contains_key(*name)) {
        return Err(Error::shape(
            "tapped features",
            expected.clone(),
            format!("no `{missing}`"),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use ndarray::{Array4, ArrayView4, Axis};

    use super::{tap_name, Backbone, FeatureShape, TappedBackbone};
    use crate::error::{Error, Result};

    /// Deterministic stand-in: every feature is the mean intensity of its image, scaled by the
    /// feature position so that different images and positions give different values.
    pub struct StubBackbone {
        pub shape: FeatureShape,
    }

    impl StubBackbone {
        pub fn new(shape: FeatureShape) -> Self {
            StubBackbone { shape }
        }
    }

    impl Backbone for StubBackbone {
        fn output_shape(&self) -> FeatureShape {
            self.shape
        }

        fn features(&self, images: ArrayView4<f32>) -> Result<Array4<f32>> {
            if images.len_of(Axis(1)) != 3 {
                return Err(Error::shape("stub images", 3, images.len_of(Axis(1))));
            }
            let FeatureShape {
                channels,
                height,
                width,
            } = self.shape;

            let means: Vec<f32> = images
                .outer_iter()
                .map(|image| image.mean().unwrap_or(0.0))
                .collect();

            Ok(Array4::from_shape_fn(
                (images.len_of(Axis(0)), channels, height, width),
                |(b, c, y, x)| means[b] * (1.0 + ((c * height + y) * width + x) as f32 * 0.01).sin(),
            ))
        }
    }

    impl TappedBackbone for StubBackbone {
        fn tapped_features(&self, images: ArrayView4<f32>) -> Result<BTreeMap<String, Array4<f32>>> {
            let features = self.features(images)?;
            Ok(self
                .tap_layers()
                .into_iter()
                .enumerate()
                .map(|(i, name)| (name, features.mapv(|v| v * i as f32)))
                .chain(std::iter::once((tap_name(99), features.clone())))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ndarray::Array4;

    use super::testing::StubBackbone;
    use super::{check_taps, tap_name, Backbone, FeatureShape, TappedBackbone};
    use crate::error::Error;

    #[test]
    fn test_feature_shape() {
        assert_eq!(FeatureShape::RESNET34.len(), 25088);

        let shape = FeatureShape {
            channels: 2,
            height: 3,
            width: 3,
        };
        assert!(shape.check(4, &Array4::zeros((4, 2, 3, 3))).is_ok());
        assert!(matches!(
            shape.check(4, &Array4::zeros((4, 2, 3, 2))),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_tapped_features() {
        let backbone = StubBackbone::new(FeatureShape {
            channels: 2,
            height: 2,
            width: 2,
        });
        let images = Array4::<f32>::ones((1, 3, 8, 8));

        let taps = backbone.tapped_features(images.view()).unwrap();
        check_taps(&backbone, &taps).unwrap();

        assert_eq!(
            backbone.tap_layers(),
            vec!["layer2", "layer4", "layer5", "layer6", "layer7"]
        );
        assert_eq!(taps[&tap_name(7)].dim(), (1, 2, 2, 2));
        assert_eq!(taps[&tap_name(99)], backbone.features(images.view()).unwrap());

        let partial: BTreeMap<_, _> = taps.into_iter().filter(|(k, _)| k != "layer5").collect();
        assert!(check_taps(&backbone, &partial).is_err());
    }
}
