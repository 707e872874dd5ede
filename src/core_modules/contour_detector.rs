// THEORY:
// The `contour_detector` is the Spatial Grouping Layer of the engine. It turns
// a binary frame into the handful of shapes that might be particle tracks.
//
// Key steps:
// 1.  **Extraction**: trace the outer boundary of every connected bright region
//     (holes and regions nested inside holes are ignored) and drop anything
//     whose enclosed area is too small to be more than sensor noise.
// 2.  **Joining**: a single physical track is often broken into several
//     fragments by uneven condensation. Fragments whose boundaries come within
//     `dist_close` of each other are grouped with a union-find over the
//     "closeness" relation, and each group is replaced by the convex hull of
//     all its points. Only every Nth boundary point takes part in the
//     closeness test, which keeps the pairwise comparison affordable.
// 3.  **Shape filtering**: particle tracks are long and thin. Round blobs
//     (low aspect ratio) and frame-wide artifacts (large width) are discarded.
//
// Like the rest of the spatial layer this is a stateless utility: it knows
// nothing about previous frames.

use crate::config::Config;
use crate::core_modules::contour::{join_contours, Contour};
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};

pub mod contour_detector {
    use super::*; // Make the stage's imports available.

    /// Outer contours of the bright regions of `binary` whose area exceeds `min_size`.
    pub fn find_prominent_contours(binary: &GrayImage, min_size: f64) -> Vec<Contour> {
        find_contours::<i32>(binary)
            .into_iter()
            .filter(|traced| traced.border_type == BorderType::Outer && traced.parent.is_none())
            .map(|traced| Contour::new(traced.points))
            .filter(|contour| contour.area() > min_size)
            .collect()
    }

    /// Groups contours that come within `closeness` of each other (directly or
    /// through a chain of close contours) and replaces each group by its
    /// convex hull. Groups are returned in order of their first member.
    pub fn join_close_contours(contours: &[Contour], closeness: f64, stride: usize) -> Vec<Contour> {
        let mut groups = DisjointSets::new(contours.len());
        for i in 0..contours.len() {
            for j in (i + 1)..contours.len() {
                if groups.find(i) != groups.find(j)
                    && contours[i].is_close_to(&contours[j], closeness, stride)
                {
                    groups.union(i, j);
                }
            }
        }

        let mut members: Vec<Vec<usize>> = Vec::new();
        let mut slot_of_root: Vec<Option<usize>> = vec![None; contours.len()];
        for i in 0..contours.len() {
            let root = groups.find(i);
            let slot = *slot_of_root[root].get_or_insert_with(|| {
                members.push(Vec::new());
                members.len() - 1
            });
            members[slot].push(i);
        }

        members
            .iter()
            .map(|group| join_contours(group.iter().map(|&i| &contours[i])))
            .collect()
    }

    /// Keeps the elongated, reasonably thin contours.
    pub fn retain_track_like(contours: Vec<Contour>, config: &Config) -> Vec<Contour> {
        contours
            .into_iter()
            .filter(|contour| {
                contour.aspect_ratio() > config.min_aspect_ratio
                    && contour.width() < config.max_contour_width
            })
            .collect()
    }

    /// The full spatial stage: extraction, joining, shape filtering.
    pub fn detect_track_contours(binary: &GrayImage, config: &Config) -> Vec<Contour> {
        let prominent = find_prominent_contours(binary, config.min_contour_size);
        let joined = join_close_contours(&prominent, config.dist_close, config.closeness_stride);
        retain_track_like(joined, config)
    }

    /// Union-find with path halving and union by size.
    struct DisjointSets {
        parent: Vec<usize>,
        size: Vec<usize>,
    }

    impl DisjointSets {
        fn new(len: usize) -> Self {
            Self {
                parent: (0..len).collect(),
                size: vec![1; len],
            }
        }

        fn find(&mut self, mut i: usize) -> usize {
            while self.parent[i] != i {
                self.parent[i] = self.parent[self.parent[i]];
                i = self.parent[i];
            }
            i
        }

        fn union(&mut self, a: usize, b: usize) {
            let (mut a, mut b) = (self.find(a), self.find(b));
            if a == b {
                return;
            }
            if self.size[a] < self.size[b] {
                std::mem::swap(&mut a, &mut b);
            }
            self.parent[b] = a;
            self.size[a] += self.size[b];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::contour_detector::*;
    use crate::config::Config;
    use crate::core_modules::contour::tests::rectangle;
    use image::{GrayImage, Luma};

    fn fill(image: &mut GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) {
        for y in y0..y1 {
            for x in x0..x1 {
                image.put_pixel(x, y, Luma([255]));
            }
        }
    }

    #[test]
    fn small_regions_are_ignored() {
        let mut binary = GrayImage::new(64, 32);
        fill(&mut binary, 5, 8, 35, 14);
        fill(&mut binary, 50, 20, 53, 23);
        let contours = find_prominent_contours(&binary, 50.0);
        assert_eq!(contours.len(), 1);
        assert!((contours[0].area() - 145.0).abs() < 1e-9);
    }

    #[test]
    fn holes_do_not_produce_contours() {
        let mut binary = GrayImage::new(40, 40);
        fill(&mut binary, 5, 5, 35, 35);
        for y in 10..30 {
            for x in 10..30 {
                binary.put_pixel(x, y, Luma([0]));
            }
        }
        let contours = find_prominent_contours(&binary, 10.0);
        assert_eq!(contours.len(), 1);
        assert!(contours[0].area() > 800.0);
    }

    #[test]
    fn close_fragments_are_joined_transitively() {
        // a~b and b~c, but a and c are far apart.
        let a = rectangle(0, 0, 10, 4);
        let b = rectangle(14, 0, 24, 4);
        let c = rectangle(28, 0, 38, 4);
        let far = rectangle(200, 200, 210, 204);
        let joined = join_close_contours(&[a, far.clone(), b, c], 5.0, 1);
        assert_eq!(joined.len(), 2);
        assert_eq!(joined[0].length(), 38.0);
        assert_eq!(joined[1], far.convex_hull());
    }

    #[test]
    fn joining_is_idempotent() {
        let contours = vec![
            rectangle(0, 0, 10, 10),
            rectangle(14, 0, 24, 10),
            rectangle(100, 100, 110, 110),
        ];
        let once = join_close_contours(&contours, 5.0, 1);
        let twice = join_close_contours(&once, 5.0, 1);
        assert_eq!(once.len(), 2);
        assert_eq!(once, twice);
    }

    #[test]
    fn joining_traced_fragments_is_idempotent() {
        let config = Config::default();
        let mut binary = GrayImage::new(600, 300);
        // A track broken in three, a diagonal streak and a distant fragment.
        fill(&mut binary, 20, 50, 120, 58);
        fill(&mut binary, 130, 52, 230, 60);
        fill(&mut binary, 240, 54, 340, 62);
        for t in 0..160 {
            fill(&mut binary, 380 + t, 20 + t / 2, 386 + t, 26 + t / 2);
        }
        fill(&mut binary, 60, 220, 180, 230);

        let prominent = find_prominent_contours(&binary, config.min_contour_size);
        assert_eq!(prominent.len(), 5);
        let once = join_close_contours(&prominent, config.dist_close, config.closeness_stride);
        let twice = join_close_contours(&once, config.dist_close, config.closeness_stride);
        assert_eq!(once.len(), 3);
        assert_eq!(once, twice);
    }

    #[test]
    fn join_never_grows_the_count() {
        let contours: Vec<_> = (0..6).map(|i| rectangle(i * 50, 0, i * 50 + 10, 5)).collect();
        assert_eq!(join_close_contours(&contours, 1.0, 10).len(), 6);
        assert_eq!(join_close_contours(&[], 1.0, 10).len(), 0);
    }

    #[test]
    fn only_elongated_thin_shapes_survive() {
        let config = Config::default();
        let streak = rectangle(0, 0, 60, 6);
        let blob = rectangle(0, 0, 20, 20);
        let slab = rectangle(0, 0, 900, 150);
        let kept = retain_track_like(vec![streak.clone(), blob, slab], &config);
        assert_eq!(kept, vec![streak]);
    }
}
