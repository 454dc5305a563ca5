// lightmap.rs -- per-face lightmap extents on the 16-unit luxel grid

use crate::bspfile::{Edge, Face, SurfEdge, TexInfo, Vertex};

/// Texture-space distance between lightmap samples.
pub const LIGHTMAP_SCALE: f64 = 16.0;

/// Bytes per lightmap sample in the canonical (RGB) lighting lump.
pub const RGB_SAMPLE_BYTES: usize = 3;

/// Face geometry tables needed to size a face's lightmaps.
pub struct FaceGeometry<'a> {
    pub texinfos: &'a [TexInfo],
    pub surfedges: &'a [SurfEdge],
    pub edges: &'a [Edge],
    pub vertices: &'a [Vertex],
}

impl<'a> FaceGeometry<'a> {
    /// Lightmap width and height in samples, or `None` when the face points
    /// outside the tables.
    pub fn lightmap_size(&self, face: &Face) -> Option<[usize; 2]> {
        let tex = self.texinfos.get(face.texinfo as usize)?;
        let mut mins = [f64::MAX; 2];
        let mut maxs = [f64::MIN; 2];

        let first = face.first_edge as usize;
        for i in 0..face.num_edges as usize {
            let se = self.surfedges.get(first + i)?;
            let edge = self.edges.get(se.edge_index())?;
            let vi = if se.edge < 0 { edge.v[1] } else { edge.v[0] };
            let v = self.vertices.get(vi as usize)?.point;

            for j in 0..2 {
                let val = v[0] as f64 * tex.vecs[j][0] as f64
                    + v[1] as f64 * tex.vecs[j][1] as f64
                    + v[2] as f64 * tex.vecs[j][2] as f64
                    + tex.vecs[j][3] as f64;
                mins[j] = mins[j].min(val);
                maxs[j] = maxs[j].max(val);
            }
        }
        if face.num_edges == 0 {
            return None;
        }

        let mut size = [0usize; 2];
        for j in 0..2 {
            let bmin = (mins[j] / LIGHTMAP_SCALE).floor();
            let bmax = (maxs[j] / LIGHTMAP_SCALE).ceil();
            size[j] = (bmax - bmin) as usize + 1;
        }
        Some(size)
    }

    /// Samples across every style of a face.
    pub fn sample_count(&self, face: &Face) -> Option<usize> {
        let [w, h] = self.lightmap_size(face)?;
        Some(w * h * face.lightmap_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bspfile::LIGHTSTYLE_NONE;

    fn quad(size: f32) -> (Vec<Vertex>, Vec<Edge>, Vec<SurfEdge>) {
        let verts = vec![
            Vertex { point: [0.0, 0.0, 0.0] },
            Vertex { point: [size, 0.0, 0.0] },
            Vertex { point: [size, size, 0.0] },
            Vertex { point: [0.0, size, 0.0] },
        ];
        let edges = vec![
            Edge { v: [0, 0] },
            Edge { v: [0, 1] },
            Edge { v: [1, 2] },
            Edge { v: [2, 3] },
            Edge { v: [3, 0] },
        ];
        let surfedges = (1..=4).map(|e| SurfEdge { edge: e }).collect();
        (verts, edges, surfedges)
    }

    fn flat_texinfo() -> TexInfo {
        TexInfo {
            vecs: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]],
            miptex: 0,
            flags: 0,
        }
    }

    #[test]
    fn sixty_four_unit_quad_has_five_by_five_samples() {
        let (vertices, edges, surfedges) = quad(64.0);
        let texinfos = [flat_texinfo()];
        let geo = FaceGeometry {
            texinfos: &texinfos,
            surfedges: &surfedges,
            edges: &edges,
            vertices: &vertices,
        };
        let face = Face {
            first_edge: 0,
            num_edges: 4,
            styles: [0, LIGHTSTYLE_NONE, LIGHTSTYLE_NONE, LIGHTSTYLE_NONE],
            ..Face::default()
        };
        assert_eq!(geo.lightmap_size(&face), Some([5, 5]));
        assert_eq!(geo.sample_count(&face), Some(25));

        let two_styles = Face {
            styles: [0, 1, LIGHTSTYLE_NONE, LIGHTSTYLE_NONE],
            ..face
        };
        assert_eq!(geo.sample_count(&two_styles), Some(50));
    }

    #[test]
    fn texture_shift_moves_grid_origin() {
        let (vertices, edges, surfedges) = quad(64.0);
        let mut tex = flat_texinfo();
        tex.vecs[0][3] = 8.0;
        let texinfos = [tex];
        let geo = FaceGeometry {
            texinfos: &texinfos,
            surfedges: &surfedges,
            edges: &edges,
            vertices: &vertices,
        };
        let face = Face {
            num_edges: 4,
            styles: [0, LIGHTSTYLE_NONE, LIGHTSTYLE_NONE, LIGHTSTYLE_NONE],
            ..Face::default()
        };
        // s spans [8, 72] -> luxels 0..5
        assert_eq!(geo.lightmap_size(&face), Some([6, 5]));
    }

    #[test]
    fn dangling_face_has_no_size() {
        let (vertices, edges, surfedges) = quad(64.0);
        let texinfos = [flat_texinfo()];
        let geo = FaceGeometry {
            texinfos: &texinfos,
            surfedges: &surfedges,
            edges: &edges,
            vertices: &vertices,
        };
        let face = Face {
            texinfo: 9,
            num_edges: 4,
            ..Face::default()
        };
        assert_eq!(geo.lightmap_size(&face), None);
    }
}
