use std::fmt;

use crate::error::{Error, Result};
use crate::shape::Shape;

// Operator descriptions
//
// A logical operator is fully described by its kind plus the shapes, kernel,
// stride and padding of its operands. Descriptions are validated once, when
// they are built, and are immutable afterwards. Every spatial parameter is a
// (height, width) pair; padding is symmetric and zero-filled.

/// Which pass of a convolution is being computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvDirection {
    Forward,
    BackwardData,
    BackwardWeights,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolAlgorithm {
    Max,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Propagation {
    Forward,
    Backward,
}

/// Closed set of operator variants an engine can be asked to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Convolution(ConvDirection),
    Pooling(PoolAlgorithm, Propagation),
}

impl OpKind {
    /// Whether the operator carries an argmax workspace.
    pub fn uses_workspace(&self) -> bool {
        matches!(self, OpKind::Pooling(PoolAlgorithm::Max, _))
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Convolution(ConvDirection::Forward) => write!(f, "conv.forward"),
            OpKind::Convolution(ConvDirection::BackwardData) => write!(f, "conv.backward_data"),
            OpKind::Convolution(ConvDirection::BackwardWeights) => {
                write!(f, "conv.backward_weights")
            }
            OpKind::Pooling(alg, prop) => {
                let alg = match alg {
                    PoolAlgorithm::Max => "max",
                    PoolAlgorithm::Average => "avg",
                };
                let prop = match prop {
                    Propagation::Forward => "forward",
                    Propagation::Backward => "backward",
                };
                write!(f, "pool.{alg}.{prop}")
            }
        }
    }
}

/// The named position a tensor plays in an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandRole {
    Src,
    Weights,
    Dst,
    DiffSrc,
    DiffWeights,
    DiffDst,
    /// Max pooling's argmax buffer.
    Workspace,
}

impl fmt::Display for OperandRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperandRole::Src => "src",
            OperandRole::Weights => "weights",
            OperandRole::Dst => "dst",
            OperandRole::DiffSrc => "diff_src",
            OperandRole::DiffWeights => "diff_weights",
            OperandRole::DiffDst => "diff_dst",
            OperandRole::Workspace => "workspace",
        };
        write!(f, "{}", s)
    }
}

fn spatial_out(input: usize, kernel: usize, stride: usize, pad: usize) -> Option<usize> {
    let padded = input + 2 * pad;
    if kernel > padded {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

/// Logical description of a 2-D convolution.
///
/// `src` is (N, C, H, W), `weights` is (O, C, KH, KW) and `dst` is derived as
/// (N, O, OH, OW). The same description serves all three directions: the
/// backward passes reuse it with gradient operands in place of src/dst.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvDesc {
    pub src: Shape,
    pub weights: Shape,
    pub dst: Shape,
    pub stride: (usize, usize),
    pub padding: (usize, usize),
}

impl ConvDesc {
    pub fn new(
        src: impl Into<Shape>,
        weights: impl Into<Shape>,
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Result<Self> {
        let src = src.into();
        let weights = weights.into();
        let op = "convolution";
        let [n, c, h, w] = src.dims4()?;
        let [o, ci, kh, kw] = weights.dims4()?;
        if c != ci {
            return Err(Error::config(
                op,
                format!("src has {c} channels but weights expect {ci}"),
            ));
        }
        if stride.0 == 0 || stride.1 == 0 {
            return Err(Error::config(op, "stride must be non-zero"));
        }
        if kh == 0 || kw == 0 || n == 0 || c == 0 || o == 0 || h == 0 || w == 0 {
            return Err(Error::config(op, format!("empty operand: src {src}, weights {weights}")));
        }
        let oh = spatial_out(h, kh, stride.0, padding.0);
        let ow = spatial_out(w, kw, stride.1, padding.1);
        let (oh, ow) = match (oh, ow) {
            (Some(oh), Some(ow)) => (oh, ow),
            _ => {
                return Err(Error::config(
                    op,
                    format!(
                        "kernel {kh}x{kw} larger than padded input {}x{}",
                        h + 2 * padding.0,
                        w + 2 * padding.1
                    ),
                ))
            }
        };
        Ok(ConvDesc {
            src,
            weights,
            dst: Shape::from((n, o, oh, ow)),
            stride,
            padding,
        })
    }

    /// Kernel extent (KH, KW).
    pub fn kernel(&self) -> (usize, usize) {
        let d = self.weights.dims();
        (d[2], d[3])
    }
}

/// Logical description of a 2-D pooling window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolDesc {
    pub algorithm: PoolAlgorithm,
    pub src: Shape,
    pub dst: Shape,
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
}

impl PoolDesc {
    pub fn new(
        algorithm: PoolAlgorithm,
        src: impl Into<Shape>,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Result<Self> {
        let src = src.into();
        let op = "pooling";
        let [n, c, h, w] = src.dims4()?;
        if stride.0 == 0 || stride.1 == 0 {
            return Err(Error::config(op, "stride must be non-zero"));
        }
        if kernel.0 == 0 || kernel.1 == 0 {
            return Err(Error::config(op, "kernel must be non-zero"));
        }
        if n == 0 || c == 0 || h == 0 || w == 0 {
            return Err(Error::config(op, format!("empty src {src}")));
        }
        let oh = spatial_out(h, kernel.0, stride.0, padding.0);
        let ow = spatial_out(w, kernel.1, stride.1, padding.1);
        let (oh, ow) = match (oh, ow) {
            (Some(oh), Some(ow)) => (oh, ow),
            _ => {
                return Err(Error::config(
                    op,
                    format!(
                        "window {}x{} larger than padded input {}x{}",
                        kernel.0,
                        kernel.1,
                        h + 2 * padding.0,
                        w + 2 * padding.1
                    ),
                ))
            }
        };
        Ok(PoolDesc {
            algorithm,
            src,
            dst: Shape::from((n, c, oh, ow)),
            kernel,
            stride,
            padding,
        })
    }
}

/// A logical operator: description plus the pass being computed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OpDesc {
    Convolution {
        direction: ConvDirection,
        desc: ConvDesc,
    },
    Pooling {
        propagation: Propagation,
        desc: PoolDesc,
    },
}

impl OpDesc {
    pub fn conv(direction: ConvDirection, desc: ConvDesc) -> Self {
        OpDesc::Convolution { direction, desc }
    }

    pub fn pool(propagation: Propagation, desc: PoolDesc) -> Self {
        OpDesc::Pooling { propagation, desc }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            OpDesc::Convolution { direction, .. } => OpKind::Convolution(*direction),
            OpDesc::Pooling { propagation, desc } => OpKind::Pooling(desc.algorithm, *propagation),
        }
    }

    /// Data roles the compute primitive reads, in binding order.
    pub fn input_roles(&self) -> &'static [OperandRole] {
        use OperandRole::*;
        match self.kind() {
            OpKind::Convolution(ConvDirection::Forward) => &[Src, Weights],
            OpKind::Convolution(ConvDirection::BackwardData) => &[DiffDst, Weights],
            OpKind::Convolution(ConvDirection::BackwardWeights) => &[DiffDst, Src],
            OpKind::Pooling(_, Propagation::Forward) => &[Src],
            OpKind::Pooling(_, Propagation::Backward) => &[DiffDst],
        }
    }

    /// The data role the compute primitive writes.
    pub fn output_role(&self) -> OperandRole {
        match self.kind() {
            OpKind::Convolution(ConvDirection::Forward) => OperandRole::Dst,
            OpKind::Convolution(ConvDirection::BackwardData) => OperandRole::DiffSrc,
            OpKind::Convolution(ConvDirection::BackwardWeights) => OperandRole::DiffWeights,
            OpKind::Pooling(_, Propagation::Forward) => OperandRole::Dst,
            OpKind::Pooling(_, Propagation::Backward) => OperandRole::DiffSrc,
        }
    }

    /// Logical shape of the operand playing `role`, if the operator has one.
    ///
    /// The max-pooling workspace has one entry per dst element.
    pub fn shape_of(&self, role: OperandRole) -> Option<&Shape> {
        use OperandRole::*;
        match self {
            OpDesc::Convolution { direction, desc } => match (direction, role) {
                (ConvDirection::Forward, Src)
                | (ConvDirection::BackwardData, DiffSrc)
                | (ConvDirection::BackwardWeights, Src) => Some(&desc.src),
                (ConvDirection::Forward, Weights)
                | (ConvDirection::BackwardData, Weights)
                | (ConvDirection::BackwardWeights, DiffWeights) => Some(&desc.weights),
                (ConvDirection::Forward, Dst)
                | (ConvDirection::BackwardData, DiffDst)
                | (ConvDirection::BackwardWeights, DiffDst) => Some(&desc.dst),
                _ => None,
            },
            OpDesc::Pooling { propagation, desc } => match (propagation, role) {
                (Propagation::Forward, Src) | (Propagation::Backward, DiffSrc) => Some(&desc.src),
                (Propagation::Forward, Dst) | (Propagation::Backward, DiffDst) => Some(&desc.dst),
                (_, Workspace) if self.kind().uses_workspace() => Some(&desc.dst),
                _ => None,
            },
        }
    }
}

impl fmt::Display for OpDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpDesc::Convolution { desc, .. } => write!(
                f,
                "{} src={} weights={} dst={} stride={:?} pad={:?}",
                self.kind(),
                desc.src,
                desc.weights,
                desc.dst,
                desc.stride,
                desc.padding
            ),
            OpDesc::Pooling { desc, .. } => write!(
                f,
                "{} src={} dst={} kernel={:?} stride={:?} pad={:?}",
                self.kind(),
                desc.src,
                desc.dst,
                desc.kernel,
                desc.stride,
                desc.padding
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_output_shape() {
        let d = ConvDesc::new((2, 3, 8, 8), (4, 3, 3, 3), (1, 1), (1, 1)).unwrap();
        assert_eq!(d.dst, Shape::from((2, 4, 8, 8)));

        let d = ConvDesc::new((1, 1, 7, 5), (2, 1, 3, 3), (2, 2), (0, 0)).unwrap();
        assert_eq!(d.dst, Shape::from((1, 2, 3, 2)));
    }

    #[test]
    fn test_conv_rejects_channel_mismatch() {
        let err = ConvDesc::new((2, 3, 8, 8), (4, 2, 3, 3), (1, 1), (1, 1)).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_conv_rejects_zero_stride_and_large_kernel() {
        assert!(ConvDesc::new((1, 1, 4, 4), (1, 1, 3, 3), (0, 1), (0, 0))
            .unwrap_err()
            .is_config());
        assert!(ConvDesc::new((1, 1, 2, 2), (1, 1, 5, 5), (1, 1), (1, 1))
            .unwrap_err()
            .is_config());
    }

    #[test]
    fn test_conv_rejects_zero_spatial_extent() {
        // Padding alone would make room for the kernel.
        let err = ConvDesc::new((1, 2, 0, 4), (3, 2, 2, 2), (1, 1), (1, 1)).unwrap_err();
        assert!(err.is_config(), "{err}");
        let err = ConvDesc::new((1, 2, 4, 0), (3, 2, 1, 1), (1, 1), (0, 0)).unwrap_err();
        assert!(err.is_config(), "{err}");
    }

    #[test]
    fn test_pool_rejects_zero_spatial_extent() {
        let err = PoolDesc::new(PoolAlgorithm::Max, (1, 2, 0, 4), (2, 2), (1, 1), (1, 1))
            .unwrap_err();
        assert!(err.is_config(), "{err}");
        let err = PoolDesc::new(PoolAlgorithm::Average, (1, 2, 4, 0), (2, 2), (1, 1), (1, 1))
            .unwrap_err();
        assert!(err.is_config(), "{err}");
    }

    #[test]
    fn test_pool_output_shape() {
        let d = PoolDesc::new(PoolAlgorithm::Max, (1, 2, 4, 4), (2, 2), (2, 2), (0, 0)).unwrap();
        assert_eq!(d.dst, Shape::from((1, 2, 2, 2)));
    }

    #[test]
    fn test_role_shapes_follow_direction() {
        let d = ConvDesc::new((2, 3, 8, 8), (4, 3, 3, 3), (1, 1), (1, 1)).unwrap();
        let bwd = OpDesc::conv(ConvDirection::BackwardData, d.clone());
        assert_eq!(bwd.shape_of(OperandRole::DiffDst), Some(&d.dst));
        assert_eq!(bwd.shape_of(OperandRole::DiffSrc), Some(&d.src));
        assert_eq!(bwd.shape_of(OperandRole::Src), None);
        assert_eq!(bwd.output_role(), OperandRole::DiffSrc);

        let p = PoolDesc::new(PoolAlgorithm::Average, (1, 2, 4, 4), (2, 2), (2, 2), (0, 0)).unwrap();
        let fwd = OpDesc::pool(Propagation::Forward, p);
        assert_eq!(fwd.shape_of(OperandRole::Workspace), None);
        assert_eq!(fwd.kind().to_string(), "pool.avg.forward");

        let p = PoolDesc::new(PoolAlgorithm::Max, (1, 2, 4, 4), (2, 2), (2, 2), (0, 0)).unwrap();
        let bwd = OpDesc::pool(Propagation::Backward, p.clone());
        assert!(bwd.kind().uses_workspace());
        assert_eq!(bwd.shape_of(OperandRole::Workspace), Some(&p.dst));
    }
}
