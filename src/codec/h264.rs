// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 slice header syntax produced by the reference tracker.
//!
//! Only the subset needed to express reference list modifications (7.3.3.1) and decoded
//! reference picture marking (7.3.3.3) is modelled here. The values are handed to the hardware
//! as-is, which writes the actual slice header.

use enumn::N;

/// `modification_of_pic_nums_idc` values, as per Table 7-7.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModificationOfPicNumsIdc {
    /// `abs_diff_pic_num_minus1` is subtracted from the picture number prediction.
    SubtractShortTerm = 0,
    /// `abs_diff_pic_num_minus1` is added to the picture number prediction.
    AddShortTerm = 1,
    /// `long_term_pic_num` is present and specifies the long-term picture number.
    LongTerm = 2,
    /// End loop for modification of the initial reference picture list.
    End = 3,
}

/// One `ref_pic_list_modification()` loop iteration for list 0.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RefPicListModification {
    pub modification_of_pic_nums_idc: ModificationOfPicNumsIdc,
    /* if modification_of_pic_nums_idc == 0 || 1 */
    pub abs_diff_pic_num_minus1: u32,
    /* if modification_of_pic_nums_idc == 2 */
    pub long_term_pic_num: u32,
}

impl RefPicListModification {
    pub fn short_term(abs_diff_pic_num_minus1: u32) -> Self {
        Self {
            modification_of_pic_nums_idc: ModificationOfPicNumsIdc::SubtractShortTerm,
            abs_diff_pic_num_minus1,
            long_term_pic_num: 0,
        }
    }

    pub fn long_term(long_term_pic_num: u32) -> Self {
        Self {
            modification_of_pic_nums_idc: ModificationOfPicNumsIdc::LongTerm,
            abs_diff_pic_num_minus1: 0,
            long_term_pic_num,
        }
    }

    pub fn end() -> Self {
        Self {
            modification_of_pic_nums_idc: ModificationOfPicNumsIdc::End,
            abs_diff_pic_num_minus1: 0,
            long_term_pic_num: 0,
        }
    }
}

/// `memory_management_control_operation` values, as per Table 7-9.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryManagementControlOperation {
    /// End `memory_management_control_operation` syntax element loop.
    End = 0,
    /// Mark a short-term reference picture as "unused for reference".
    UnmarkShortTerm = 1,
    /// Mark a long-term reference picture as "unused for reference".
    UnmarkLongTerm = 2,
    /// Assign a long-term frame index to a short-term reference picture.
    ShortTermToLongTerm = 3,
    /// Specify the maximum long-term frame index and mark all long-term reference pictures
    /// having long-term frame indices greater than the maximum value as "unused for reference".
    MaxLongTermFrameIdx = 4,
    /// Mark all reference pictures as "unused for reference".
    UnmarkAll = 5,
    /// Mark the current picture as "used for long-term reference" and assign a long-term frame
    /// index to it.
    MarkCurrentAsLongTerm = 6,
}

/// One `dec_ref_pic_marking()` loop iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    pub memory_management_control_operation: MemoryManagementControlOperation,

    /// Used (with memory_management_control_operation equal to 3 or 1) to
    /// assign a long-term frame index to a short-term reference picture or to
    /// mark a short-term reference picture as "unused for reference".
    pub difference_of_pic_nums_minus1: u8,

    /// Used (with memory_management_control_operation equal to 2) to mark a
    /// long-term reference picture as "unused for reference".
    pub long_term_pic_num: u8,

    /// Used (with memory_management_control_operation equal to 3 or 6) to
    /// assign a long-term frame index to a picture.
    pub long_term_frame_idx: u8,

    /// Specifies the maximum value of long-term frame index allowed for
    /// long-term reference pictures, plus one.
    pub max_long_term_frame_idx_plus1: u8,
}

impl RefPicMarkingInner {
    fn op(memory_management_control_operation: MemoryManagementControlOperation) -> Self {
        Self {
            memory_management_control_operation,
            difference_of_pic_nums_minus1: 0,
            long_term_pic_num: 0,
            long_term_frame_idx: 0,
            max_long_term_frame_idx_plus1: 0,
        }
    }

    pub fn max_long_term_frame_idx(max_long_term_references: u8) -> Self {
        Self {
            max_long_term_frame_idx_plus1: max_long_term_references,
            ..Self::op(MemoryManagementControlOperation::MaxLongTermFrameIdx)
        }
    }

    pub fn mark_current_as_long_term(long_term_frame_idx: u8) -> Self {
        Self {
            long_term_frame_idx,
            ..Self::op(MemoryManagementControlOperation::MarkCurrentAsLongTerm)
        }
    }

    pub fn end() -> Self {
        Self::op(MemoryManagementControlOperation::End)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_values() {
        assert_eq!(
            MemoryManagementControlOperation::n(6),
            Some(MemoryManagementControlOperation::MarkCurrentAsLongTerm)
        );
        assert_eq!(MemoryManagementControlOperation::n(7), None);
        assert_eq!(ModificationOfPicNumsIdc::n(3), Some(ModificationOfPicNumsIdc::End));
        assert_eq!(ModificationOfPicNumsIdc::LongTerm as u8, 2);
    }

    #[test]
    fn marking_constructors() {
        let cap = RefPicMarkingInner::max_long_term_frame_idx(2);
        assert_eq!(
            cap.memory_management_control_operation,
            MemoryManagementControlOperation::MaxLongTermFrameIdx
        );
        assert_eq!(cap.max_long_term_frame_idx_plus1, 2);

        let mark = RefPicMarkingInner::mark_current_as_long_term(1);
        assert_eq!(mark.long_term_frame_idx, 1);
        assert_eq!(mark.max_long_term_frame_idx_plus1, 0);
    }
}
