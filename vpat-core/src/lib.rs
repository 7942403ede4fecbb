pub mod document;
pub mod formula;

pub mod geometry {
    use glam::DVec2;
    use serde::{Deserialize, Serialize};

    /// 二维点，内部以 `glam::DVec2` 表示。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_vec(vec: DVec2) -> Self {
            Self(vec)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn translate(self, offset: Vector2) -> Self {
            Self(self.0 + offset.0)
        }

        #[inline]
        pub fn vector_to(self, other: Point2) -> Vector2 {
            Vector2(other.0 - self.0)
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }

        /// 绕 `center` 逆时针旋转 `degrees` 度。
        pub fn rotate_around(self, center: Point2, degrees: f64) -> Self {
            let rotation = DVec2::from_angle(degrees.to_radians());
            Self(center.0 + rotation.rotate(self.0 - center.0))
        }

        /// 以经过 `origin` 的轴做镜像。
        pub fn flip(self, origin: Point2, axis: Axis) -> Self {
            match axis {
                Axis::Vertical => Self::new(2.0 * origin.x() - self.x(), self.y()),
                Axis::Horizontal => Self::new(self.x(), 2.0 * origin.y() - self.y()),
            }
        }

        /// 以经过 `first` 与 `second` 的直线做镜像。两点重合时原样返回。
        pub fn flip_across(self, first: Point2, second: Point2) -> Self {
            let direction = second.0 - first.0;
            let length_squared = direction.length_squared();
            if length_squared <= f64::EPSILON {
                return self;
            }
            let foot = first.0 + direction * ((self.0 - first.0).dot(direction) / length_squared);
            Self(foot * 2.0 - self.0)
        }

        #[inline]
        pub fn distance(self, other: Point2) -> f64 {
            self.0.distance(other.0)
        }
    }

    impl From<DVec2> for Point2 {
        fn from(value: DVec2) -> Self {
            Self::from_vec(value)
        }
    }

    /// 二维向量。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector2(pub DVec2);

    impl Vector2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        /// 由极坐标（长度 + 角度，单位为度）构造。
        #[inline]
        pub fn from_polar(length: f64, degrees: f64) -> Self {
            Self(DVec2::from_angle(degrees.to_radians()) * length)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Axis {
        Vertical,
        Horizontal,
    }

    impl Axis {
        pub fn parse(value: &str) -> Option<Self> {
            match value.trim() {
                "vertical" => Some(Axis::Vertical),
                "horizontal" => Some(Axis::Horizontal),
                _ => None,
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                Axis::Vertical => "vertical",
                Axis::Horizontal => "horizontal",
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn rotation_around_center() {
            let p = Point2::new(10.0, 0.0).rotate_around(Point2::new(0.0, 0.0), 90.0);
            assert!(p.x().abs() < 1e-9);
            assert!((p.y() - 10.0).abs() < 1e-9);
        }

        #[test]
        fn flip_mirrors_through_origin_axis() {
            let origin = Point2::new(5.0, 5.0);
            let p = Point2::new(7.0, 1.0);
            assert_eq!(p.flip(origin, Axis::Vertical), Point2::new(3.0, 1.0));
            assert_eq!(p.flip(origin, Axis::Horizontal), Point2::new(7.0, 9.0));
        }

        #[test]
        fn flip_across_mirrors_through_arbitrary_line() {
            let p = Point2::new(2.0, 0.0).flip_across(Point2::new(0.0, 0.0), Point2::new(1.0, 1.0));
            assert!(p.distance(Point2::new(0.0, 2.0)) < 1e-9);
            let same = Point2::new(3.0, 4.0);
            assert_eq!(same.flip_across(Point2::new(1.0, 1.0), Point2::new(1.0, 1.0)), same);
        }

        #[test]
        fn polar_vector_translation() {
            let moved = Point2::new(1.0, 1.0).translate(Vector2::from_polar(2.0, 0.0));
            assert!((moved.x() - 3.0).abs() < 1e-9);
            assert!((moved.y() - 1.0).abs() < 1e-9);
        }
    }
}
