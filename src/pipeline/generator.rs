use crate::error::{Error, Result};
use crate::pipeline::config::GeneratorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Tanh,
}

/// One transposed convolution of the generator, with the layers that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransposedConvSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub batch_norm: bool,
    pub activation: Activation,
}

impl TransposedConvSpec {
    fn block(in_channels: usize, out_channels: usize, kernel: usize, stride: usize) -> Self {
        TransposedConvSpec {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding: 1,
            batch_norm: true,
            activation: Activation::Relu,
        }
    }

    /// Spatial size produced from an input of side `size`, `(size - 1) * stride - 2 * padding + kernel`.
    pub fn output_size(&self, size: usize) -> Option<usize> {
        (size.checked_sub(1)? * self.stride + self.kernel).checked_sub(2 * self.padding)
    }
}

/// Lays out a generator growing `input_size` maps with `input_channels` channels into a single
/// channel image of side `target_size`.
///
/// The first block doubles the size, further doubling blocks halve the channels until the map
/// reaches half the target, `additional_blocks` size-preserving blocks halve the channels again and
/// a last doubling layer maps to one channel through a tanh.
pub fn generator_layers(
    input_size: usize,
    target_size: usize,
    input_channels: usize,
    additional_blocks: usize,
) -> Result<Vec<TransposedConvSpec>> {
    if input_size == 0 {
        return Err(Error::Configuration("generator input size must be positive".into()));
    }

    let mut layers = vec![TransposedConvSpec::block(input_channels, input_channels, 4, 2)];
    let mut channels = input_channels;

    let mut size = input_size * 2;
    while size < target_size / 2 {
        layers.push(TransposedConvSpec::block(channels, channels / 2, 4, 2));
        channels /= 2;
        size *= 2;
    }

    for _ in 0..additional_blocks {
        layers.push(TransposedConvSpec::block(channels, channels / 2, 3, 1));
        channels /= 2;
    }

    layers.push(TransposedConvSpec {
        batch_norm: false,
        activation: Activation::Tanh,
        ..TransposedConvSpec::block(channels, 1, 4, 2)
    });

    check_layers(&layers, input_size, target_size)?;
    tracing::debug!("generator with {} layers: {layers:?}", layers.len());
    Ok(layers)
}

fn check_layers(layers: &[TransposedConvSpec], input_size: usize, target_size: usize) -> Result<()> {
    if let Some((i, layer)) = layers
        .iter()
        .enumerate()
        .find(|(_, layer)| layer.in_channels == 0 || layer.out_channels == 0)
    {
        return Err(Error::Configuration(format!(
            "generator layer {i} has no channels ({} -> {})",
            layer.in_channels, layer.out_channels
        )));
    }

    let mut size = input_size;
    for (i, layer) in layers.iter().enumerate() {
        size = layer.output_size(size).ok_or_else(|| {
            Error::Configuration(format!("generator layer {i} gets an input of size {size}"))
        })?;
    }
    if size != target_size {
        return Err(Error::Configuration(format!(
            "generator produces {size} x {size} images instead of {target_size} x {target_size}"
        )));
    }
    Ok(())
}

impl GeneratorConfig {
    pub fn layers(&self) -> Result<Vec<TransposedConvSpec>> {
        generator_layers(
            self.input_size,
            self.target_size,
            self.input_channels,
            self.additional_blocks,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{generator_layers, Activation, TransposedConvSpec};
    use crate::error::Error;
    use crate::pipeline::config::GeneratorConfig;

    #[test]
    fn test_default_layers() {
        let layers = GeneratorConfig::new().layers().unwrap();

        let channels: Vec<_> = layers
            .iter()
            .map(|layer| (layer.in_channels, layer.out_channels))
            .collect();
        assert_eq!(
            channels,
            vec![(40, 40), (40, 20), (20, 10), (10, 5), (5, 2), (2, 1), (1, 1)]
        );

        assert_eq!((layers[0].kernel, layers[0].stride), (4, 2));
        assert!(layers[1..6].iter().all(|l| l.kernel == 3 && l.stride == 1));

        let last = &layers[6];
        assert!(!last.batch_norm);
        assert_eq!(last.activation, Activation::Tanh);
        assert!(layers[..6].iter().all(|l| l.batch_norm && l.activation == Activation::Relu));
    }

    #[test]
    fn test_doubling_blocks() {
        // 4 -> 8 -> 16 -> 32, then the final layer reaches 64
        let layers = generator_layers(4, 64, 64, 2).unwrap();

        let strided = layers.iter().filter(|l| l.stride == 2).count();
        assert_eq!(strided, 4);
        assert_eq!(layers.len(), 6);
        assert_eq!(layers[2].out_channels, 16);
        assert_eq!(layers[4].out_channels, 4);
    }

    #[test]
    fn test_output_size() {
        let block = TransposedConvSpec {
            in_channels: 1,
            out_channels: 1,
            kernel: 3,
            stride: 1,
            padding: 1,
            batch_norm: true,
            activation: Activation::Relu,
        };
        assert_eq!(block.output_size(14), Some(14));
        assert_eq!(block.output_size(0), None);
    }

    #[test]
    fn test_rejects_invalid_layouts() {
        // too many halving blocks run out of channels
        assert!(matches!(
            generator_layers(7, 28, 40, 6),
            Err(Error::Configuration(_))
        ));
        // 7 -> 14 -> 28 cannot produce a 30 x 30 image
        assert!(matches!(
            generator_layers(7, 30, 40, 1),
            Err(Error::Configuration(_))
        ));
        assert!(generator_layers(0, 28, 40, 1).is_err());
    }
}
