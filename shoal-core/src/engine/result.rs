use shoal_protocol::Value;

/// Column description written before result rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub alias: String,
    pub schema_name: String,
    pub table_name: String,
    pub column_name: String,
    pub value_type: i32,
    pub precision: i64,
    pub scale: i32,
    pub display_size: i32,
    pub auto_increment: bool,
    pub nullable: i32,
}

/// A fully materialized result with a forward cursor.
#[derive(Debug, Clone)]
pub struct LocalResult {
    columns: Vec<ColumnMeta>,
    rows: Vec<Vec<Value>>,
    position: usize,
    scrollable: bool,
    closed: bool,
}

impl LocalResult {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Vec<Value>>, scrollable: bool) -> Self {
        Self {
            columns,
            rows,
            position: 0,
            scrollable,
            closed: false,
        }
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> i32 {
        self.rows.len() as i32
    }

    pub fn is_scrollable(&self) -> bool {
        self.scrollable
    }

    /// Advance the cursor and return the row it now points at.
    pub fn next_row(&mut self) -> Option<&[Value]> {
        if self.closed || self.position >= self.rows.len() {
            return None;
        }
        let row = &self.rows[self.position];
        self.position += 1;
        Some(row)
    }

    /// Values of every remaining row, consuming up to `count` rows.
    pub fn take_rows(&mut self, count: usize) -> Vec<Vec<Value>> {
        let mut out = Vec::with_capacity(count.min(self.rows.len()));
        while out.len() < count {
            match self.next_row() {
                Some(row) => out.push(row.to_vec()),
                None => break,
            }
        }
        out
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.rows.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(n: i32) -> LocalResult {
        let rows = (0..n).map(|i| vec![Value::Int(i)]).collect();
        LocalResult::new(Vec::new(), rows, false)
    }

    #[test]
    fn take_rows_respects_count_and_end() {
        let mut result = result_with(5);
        assert_eq!(result.take_rows(2).len(), 2);
        assert_eq!(result.take_rows(10).len(), 3);
        assert!(result.take_rows(1).is_empty());
    }

    #[test]
    fn reset_rewinds_cursor() {
        let mut result = result_with(2);
        result.take_rows(2);
        result.reset();
        assert_eq!(result.next_row(), Some(&[Value::Int(0)][..]));
    }

    #[test]
    fn closed_result_yields_nothing() {
        let mut result = result_with(3);
        result.close();
        assert!(result.is_closed());
        assert!(result.next_row().is_none());
    }
}
