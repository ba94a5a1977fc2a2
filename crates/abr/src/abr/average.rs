use std::collections::VecDeque;

/// Average over the last `capacity` samples.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl MovingAverage {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Multiplies every sample in the history by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for sample in self.samples.iter_mut() {
            *sample *= factor;
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_drops_oldest() {
        let mut average = MovingAverage::new(3);
        assert_eq!(average.average(), None);
        for value in [1.0, 2.0, 3.0, 10.0] {
            average.add(value);
        }
        assert_eq!(average.len(), 3);
        assert_eq!(average.last(), Some(10.0));
        assert_eq!(average.average(), Some(5.0));

        average.scale(0.5);
        assert_eq!(average.average(), Some(2.5));
    }
}
