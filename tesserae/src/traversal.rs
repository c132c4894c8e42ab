//! Spatial traversal orders over the output tile grid. Snake (boustrophedon)
//! orders keep consecutive tiles edge-adjacent so one MatMul operand can stay
//! stationary between tiles.

use crate::cost::{has_matmul, input_role, input_tile_size, primary_output, InputRole};
use crate::graph::Boundary;
use crate::problem::{Granularity, OpIdx, Problem};
use crate::utils::ceil_div;

/// Row-major snake: left-to-right on even rows, reversed on odd rows.
pub fn row_snake(n_cols: usize, n_rows: usize) -> Vec<usize> {
    let mut order = Vec::with_capacity(n_cols * n_rows);
    for row in 0..n_rows {
        if row % 2 == 0 {
            order.extend((0..n_cols).map(|col| row * n_cols + col));
        } else {
            order.extend((0..n_cols).rev().map(|col| row * n_cols + col));
        }
    }
    order
}

/// Column-major snake: top-to-bottom on even columns, reversed on odd ones.
pub fn column_snake(n_cols: usize, n_rows: usize) -> Vec<usize> {
    let mut order = Vec::with_capacity(n_cols * n_rows);
    for col in 0..n_cols {
        if col % 2 == 0 {
            order.extend((0..n_rows).map(|row| row * n_cols + col));
        } else {
            order.extend((0..n_rows).rev().map(|row| row * n_cols + col));
        }
    }
    order
}

/// Choose a traversal for the subgraph under the given tile shape. Returns an
/// empty order (the row-major default) for a single spatial tile. For MatMul
/// subgraphs, picks the snake direction whose stationary side saves more
/// bandwidth; ties go to row-major.
pub fn best_traversal(problem: &Problem, ops: &[OpIdx], g: Granularity) -> Vec<usize> {
    let out = problem.tensors[primary_output(problem, ops)];
    let n_cols = ceil_div(out.width.get().into(), g.w.get().into()) as usize;
    let n_rows = ceil_div(out.height.get().into(), g.h.get().into()) as usize;

    if n_cols * n_rows <= 1 {
        return Vec::new();
    }

    if !has_matmul(problem, ops) {
        return if n_cols >= n_rows {
            row_snake(n_cols, n_rows)
        } else {
            column_snake(n_cols, n_rows)
        };
    }

    let boundary = Boundary::of(problem, ops);
    let mut lhs_bytes = 0u64;
    let mut rhs_bytes = 0u64;
    for &t in &boundary.inputs {
        match input_role(problem, ops, t) {
            InputRole::MatMulLhs => lhs_bytes += input_tile_size(problem, ops, t, g),
            InputRole::MatMulRhs => rhs_bytes += input_tile_size(problem, ops, t, g),
            InputRole::Pointwise => {}
        }
    }

    // Row-major keeps the LHS stationary along each row; column-major keeps
    // the RHS stationary along each column.
    let row_major_savings = lhs_bytes * (n_cols as u64 - 1) * n_rows as u64;
    let col_major_savings = rhs_bytes * (n_rows as u64 - 1) * n_cols as u64;

    if col_major_savings > row_major_savings {
        column_snake(n_cols, n_rows)
    } else {
        row_snake(n_cols, n_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::testing::*;

    #[test]
    fn test_row_snake() {
        assert_eq!(row_snake(3, 2), vec![0, 1, 2, 5, 4, 3]);
        assert_eq!(row_snake(1, 3), vec![0, 1, 2]);
    }

    #[test]
    fn test_column_snake() {
        assert_eq!(column_snake(3, 2), vec![0, 3, 4, 1, 2, 5]);
        assert_eq!(column_snake(2, 2), vec![0, 2, 3, 1]);
    }

    #[test]
    fn test_snake_orders_are_permutations() {
        for (c, r) in [(1, 1), (4, 3), (5, 5)] {
            let mut o = row_snake(c, r);
            o.sort_unstable();
            assert_eq!(o, (0..c * r).collect::<Vec<_>>());
            let mut o = column_snake(c, r);
            o.sort_unstable();
            assert_eq!(o, (0..c * r).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_single_tile_gets_default_order() {
        let p = problem(
            vec![tensor(128, 128); 2],
            vec![pointwise(&[0], 1, 10)],
            60000,
            20,
            128,
        );
        assert!(best_traversal(&p, &[0], gran(128, 128, 1)).is_empty());
    }

    #[test]
    fn test_pointwise_prefers_wide_axis() {
        let p = problem(
            vec![tensor(512, 256); 2],
            vec![pointwise(&[0], 1, 10)],
            60000,
            20,
            128,
        );
        // 4 cols ≥ 2 rows: row snake.
        assert_eq!(
            best_traversal(&p, &[0], gran(128, 128, 1)),
            row_snake(4, 2)
        );
        let tall = problem(
            vec![tensor(256, 512); 2],
            vec![pointwise(&[0], 1, 10)],
            60000,
            20,
            128,
        );
        assert_eq!(
            best_traversal(&tall, &[0], gran(128, 128, 1)),
            column_snake(2, 4)
        );
    }

    #[test]
    fn test_matmul_direction_follows_savings() {
        let p = problem(
            vec![tensor(512, 512); 3],
            vec![matmul(0, 1, 2, 100)],
            60000,
            20,
            128,
        );
        // LHS tile 128·128 = RHS tile 128·128 and the grid is square, so the
        // savings tie and row-major wins.
        assert_eq!(
            best_traversal(&p, &[0], gran(128, 128, 128)),
            row_snake(4, 4)
        );
        // A wider RHS tile tips the choice to column-major.
        assert_eq!(
            best_traversal(&p, &[0], gran(170, 128, 128)),
            column_snake(4, 4)
        );
    }
}
